use ap_core::dependency;
use ap_core::types::*;

fn counts_add_up(list: &TodoList) {
    let c = &list.counts;
    assert_eq!(
        c.pending + c.in_progress + c.completed + c.failed + c.cancelled,
        list.total_todos,
        "status counters drifted from total"
    );
    assert_eq!(list.total_todos, list.todos.len());
}

#[test]
fn todo_status_valid_transitions() {
    assert!(TodoStatus::Pending.can_transition_to(&TodoStatus::InProgress));
    assert!(TodoStatus::InProgress.can_transition_to(&TodoStatus::Completed));
    assert!(TodoStatus::InProgress.can_transition_to(&TodoStatus::Failed));
    assert!(TodoStatus::InProgress.can_transition_to(&TodoStatus::Pending));
    assert!(TodoStatus::Pending.can_transition_to(&TodoStatus::Cancelled));
    assert!(TodoStatus::InProgress.can_transition_to(&TodoStatus::Cancelled));
}

#[test]
fn todo_status_terminal_states_never_reopen() {
    for terminal in [TodoStatus::Completed, TodoStatus::Failed, TodoStatus::Cancelled] {
        assert!(terminal.is_terminal());
        assert!(!terminal.can_transition_to(&TodoStatus::Pending));
        assert!(!terminal.can_transition_to(&TodoStatus::InProgress));
    }
    assert!(!TodoStatus::Pending.can_transition_to(&TodoStatus::Completed));
}

#[test]
fn counters_hold_through_a_full_lifecycle() {
    let mut list = TodoList::new(
        "ship feature",
        vec![
            Todo::new("a", TodoKind::Analysis).with_id("a"),
            Todo::new("b", TodoKind::CodeChange).with_id("b"),
            Todo::new("c", TodoKind::Test).with_id("c"),
        ],
    );
    counts_add_up(&list);
    assert_eq!(list.counts.pending, 3);

    list.start("a").unwrap();
    counts_add_up(&list);
    list.complete("a", &ExecutionResult::success("done")).unwrap();
    counts_add_up(&list);

    list.start("b").unwrap();
    list.retry("b", "flaky").unwrap();
    counts_add_up(&list);
    assert_eq!(list.get("b").unwrap().attempt, 1);
    assert_eq!(list.get("b").unwrap().last_error.as_deref(), Some("flaky"));

    list.start("b").unwrap();
    list.fail("b", "broken").unwrap();
    counts_add_up(&list);

    let cancelled = list.cancel_pending("halted");
    assert_eq!(cancelled, vec!["c".to_string()]);
    counts_add_up(&list);

    assert!(list.is_finished());
    assert!(!list.all_completed());
    assert_eq!(list.counts.completed, 1);
    assert_eq!(list.counts.failed, 1);
    assert_eq!(list.counts.cancelled, 1);
    assert!((list.progress() - 1.0 / 3.0).abs() < f64::EPSILON);
}

#[test]
fn completed_item_cannot_be_retried() {
    let mut list = TodoList::new("x", vec![Todo::new("a", TodoKind::Analysis).with_id("a")]);
    list.start("a").unwrap();
    list.complete("a", &ExecutionResult::success("")).unwrap();
    let err = list.retry("a", "late").unwrap_err();
    assert!(matches!(err, TransitionError::Invalid { .. }));
    assert_eq!(list.status_of("a"), Some(TodoStatus::Completed));
}

#[test]
fn unknown_id_is_not_found() {
    let mut list = TodoList::new("x", vec![]);
    assert!(matches!(list.start("ghost"), Err(TransitionError::NotFound(_))));
    assert_eq!(list.progress(), 1.0);
}

#[test]
fn summary_names_terminal_failures() {
    let mut list = TodoList::new(
        "x",
        vec![Todo::new("compile crate", TodoKind::CodeChange).with_id("a")],
    );
    list.start("a").unwrap();
    list.fail("a", "linker error").unwrap();
    let summary = list.summary();
    assert!(summary.contains("1 failed"));
    assert!(summary.contains("linker error"));
}

#[test]
fn ready_set_follows_completion() {
    let mut list = TodoList::new(
        "x",
        vec![
            Todo::new("a", TodoKind::Analysis).with_id("a").with_priority(80),
            Todo::new("b", TodoKind::CodeChange)
                .with_id("b")
                .with_priority(90)
                .with_dependencies(["a"]),
        ],
    );
    dependency::validate(&list).unwrap();
    assert_eq!(dependency::ready_set(&list), vec!["a".to_string()]);

    list.start("a").unwrap();
    assert!(dependency::ready_set(&list).is_empty());
    list.complete("a", &ExecutionResult::success("")).unwrap();
    assert_eq!(dependency::ready_set(&list), vec!["b".to_string()]);
}

#[test]
fn snapshot_json_uses_type_field_for_kind() {
    let todo = Todo::new("write docs", TodoKind::Documentation).with_id("d");
    let value = serde_json::to_value(&todo).unwrap();
    assert_eq!(value["type"], "documentation");
    let back: Todo = serde_json::from_value(value).unwrap();
    assert_eq!(back.kind, TodoKind::Documentation);
}
