//! Engine tests against a journaling fake provider. No platform calls.
use std::sync::Mutex;

use pretty_assertions::assert_eq;

use crate::{self as formant, remote::Remote, *};

type Journal = Mutex<Vec<String>>;

#[derive(Clone, Debug, PartialEq, HasDependencies, serde::Serialize, serde::Deserialize)]
struct Widget {
    label: String,
    input: Remote<String>,
}

impl Widget {
    fn new(label: &str) -> Self {
        Widget {
            label: label.to_owned(),
            input: "".into(),
        }
    }

    fn with_input(mut self, input: Remote<String>) -> Self {
        self.input = input;
        self
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct WidgetOutput {
    value: String,
}

impl Resource for Widget {
    type Provider = Journal;
    type Error = anyhow::Error;
    type Output = WidgetOutput;

    async fn create(&self, journal: &Journal) -> anyhow::Result<WidgetOutput> {
        journal
            .lock()
            .unwrap()
            .push(format!("create {}", self.label));
        Ok(WidgetOutput {
            value: format!("{}:{}", self.label, self.input.try_get().unwrap_or_default()),
        })
    }

    async fn delete(&self, journal: &Journal, previous: &WidgetOutput) -> anyhow::Result<()> {
        journal
            .lock()
            .unwrap()
            .push(format!("delete {}", previous.value));
        Ok(())
    }
}

fn tmpdir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir()
        .join("formant-test")
        .join(format!("{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn step_of(plan: &Plan<Journal>, id: &str) -> usize {
    plan.actions
        .iter()
        .find(|a| a.id == id)
        .unwrap_or_else(|| panic!("'{id}' is not in the plan"))
        .step
}

fn journal_of(stack: &Stack<Journal>) -> Vec<String> {
    stack.provider().lock().unwrap().clone()
}

#[tokio::test]
async fn plan_orders_creates_by_dependency() {
    let _ = env_logger::builder().try_init();
    let dir = tmpdir("plan_orders_creates_by_dependency");
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();

    let a = stack.resource("a", Widget::new("a")).unwrap();
    let b = stack
        .resource(
            "b",
            Widget::new("b").with_input(a.output(|o| o.value.clone())),
        )
        .unwrap();
    let c = stack
        .resource(
            "c",
            Widget::new("c").with_input(b.output(|o| o.value.clone())),
        )
        .unwrap();
    stack.export("chain", c.output(|o| o.value.clone()));

    let plan = stack.plan().unwrap();
    assert!(step_of(&plan, "a") < step_of(&plan, "b"));
    assert!(step_of(&plan, "b") < step_of(&plan, "c"));

    let outputs = stack.apply(plan).await.unwrap();
    assert_eq!(
        vec![
            "create a".to_owned(),
            "create b".to_owned(),
            "create c".to_owned()
        ],
        journal_of(&stack)
    );
    assert_eq!(Some(&"c:b:a:".to_owned()), outputs.get("chain"));
}

#[tokio::test]
async fn redeclaring_loads_instead_of_creating() {
    let _ = env_logger::builder().try_init();
    let dir = tmpdir("redeclaring_loads_instead_of_creating");
    {
        let mut stack = Stack::new(&dir, Journal::default()).unwrap();
        let _ = stack.resource("a", Widget::new("a")).unwrap();
        let plan = stack.plan().unwrap();
        stack.apply(plan).await.unwrap();
    }

    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let a = stack.resource("a", Widget::new("a")).unwrap();
    assert_eq!(Action::Load, a.action());
    // The stored output resolves without another apply.
    assert_eq!("a:", a.output(|o| o.value.clone()).get().unwrap());

    let plan = stack.plan().unwrap();
    assert!(plan.actions.iter().all(|a| a.action == Action::Load));
    stack.apply(plan).await.unwrap();
    assert!(journal_of(&stack).is_empty());
}

#[tokio::test]
async fn explicit_dependency_orders_unrelated_resources() {
    let dir = tmpdir("explicit_dependency_orders_unrelated_resources");
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();

    let a = stack.resource("a", Widget::new("a")).unwrap();
    let b = stack.resource("b", Widget::new("b")).unwrap();
    stack.add_dependency(&b, &a).unwrap();

    assert_eq!(Some(vec!["a".to_owned()]), stack.dependencies_of("b"));
    let plan = stack.plan().unwrap();
    assert!(step_of(&plan, "a") < step_of(&plan, "b"));
}

#[tokio::test]
async fn component_children_are_destroyed_before_parent() {
    let _ = env_logger::builder().try_init();
    let dir = tmpdir("component_children_are_destroyed_before_parent");

    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let group = stack.component("group").unwrap();
    let _x = stack.resource_in(&group, "group-x", Widget::new("x")).unwrap();
    let _y = stack.resource_in(&group, "group-y", Widget::new("y")).unwrap();

    assert_eq!(Some("group".to_owned()), stack.parent_of("group-x"));
    assert_eq!(
        vec!["group-x".to_owned(), "group-y".to_owned()],
        stack.children_of("group")
    );

    let plan = stack.plan().unwrap();
    stack.apply(plan).await.unwrap();

    // Re-open, re-declare (registering the deleter) and tear down.
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let group = stack.component("group").unwrap();
    let _x = stack.resource_in(&group, "group-x", Widget::new("x")).unwrap();
    let _y = stack.resource_in(&group, "group-y", Widget::new("y")).unwrap();
    let teardown = stack.teardown().unwrap();
    assert!(step_of(&teardown, "group-x") < step_of(&teardown, "group"));
    assert!(step_of(&teardown, "group-y") < step_of(&teardown, "group"));
    stack.apply(teardown).await.unwrap();

    let mut journal = journal_of(&stack);
    journal.sort();
    assert_eq!(vec!["delete x:".to_owned(), "delete y:".to_owned()], journal);

    // Everything is gone from the state.
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let a = stack.resource("group-x", Widget::new("x")).unwrap();
    assert_eq!(Action::Create, a.action());
}

#[tokio::test]
async fn empty_and_duplicate_names_are_rejected() {
    let dir = tmpdir("empty_and_duplicate_names_are_rejected");
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();

    assert!(matches!(
        stack.resource("", Widget::new("nameless")),
        Err(Error::EmptyName)
    ));

    let _ = stack.resource("a", Widget::new("a")).unwrap();
    match stack.resource("a", Widget::new("a")) {
        Err(Error::DuplicateName { name }) => assert_eq!("a", name),
        other => panic!("expected DuplicateName, got {other:?}"),
    }
}

#[tokio::test]
async fn unresolved_remote_names_its_dependency() {
    let dir = tmpdir("unresolved_remote_names_its_dependency");
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();

    let a = stack.resource("a", Widget::new("a")).unwrap();
    let value = a.output(|o| o.value.clone());
    let err = value.get().unwrap_err();
    assert!(
        err.to_string().contains("Depends on a"),
        "unexpected error: {err}"
    );
}

#[test]
fn remote_serializes_through_its_proxy() {
    let literal: Remote<String> = "hi".into();
    let json = serde_json::to_value(&literal).unwrap();
    assert_eq!(
        serde_json::json!({ "depends_on": null, "last_known_value": "hi" }),
        json
    );

    let back: Remote<String> = serde_json::from_value(json).unwrap();
    assert_eq!("hi", back.get().unwrap());
    assert!(back.depends_on().is_none());
}

#[tokio::test]
async fn orphaned_resources_are_destroyed_dependents_first() {
    let _ = env_logger::builder().try_init();
    let dir = tmpdir("orphaned_resources_are_destroyed_dependents_first");
    {
        let mut stack = Stack::new(&dir, Journal::default()).unwrap();
        let a = stack.resource("a", Widget::new("a")).unwrap();
        let _b = stack
            .resource(
                "b",
                Widget::new("b").with_input(a.output(|o| o.value.clone())),
            )
            .unwrap();
        let plan = stack.plan().unwrap();
        stack.apply(plan).await.unwrap();
    }

    // A new program without 'a' and 'b' orphans both of them.
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let _c = stack.resource("c", Widget::new("c")).unwrap();
    let plan = stack.plan().unwrap();
    let orphans: Vec<_> = plan.actions.iter().filter(|a| a.is_orphan).collect();
    assert_eq!(2, orphans.len());
    assert!(orphans
        .iter()
        .all(|action| action.action == Action::Destroy));
    assert!(step_of(&plan, "b") < step_of(&plan, "a"));

    stack.apply(plan).await.unwrap();
    let journal = journal_of(&stack);
    assert_eq!(3, journal.len());
    let position = |entry: &str| {
        journal
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("'{entry}' is not in the journal {journal:?}"))
    };
    position("create c");
    assert!(position("delete b:a:") < position("delete a:"));
}

#[tokio::test]
async fn orphaned_component_bundle_is_destroyed_children_first() {
    let _ = env_logger::builder().try_init();
    let dir = tmpdir("orphaned_component_bundle_is_destroyed_children_first");
    {
        let mut stack = Stack::new(&dir, Journal::default()).unwrap();
        let group = stack.component("group").unwrap();
        let _x = stack.resource_in(&group, "group-x", Widget::new("x")).unwrap();
        let _y = stack.resource_in(&group, "group-y", Widget::new("y")).unwrap();
        let plan = stack.plan().unwrap();
        stack.apply(plan).await.unwrap();
    }

    // A new program that never mentions the bundle orphans all three
    // entries, and the re-opened state must already hold them.
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let _c = stack.resource("c", Widget::new("c")).unwrap();
    let plan = stack.plan().unwrap();
    let orphans: Vec<_> = plan.actions.iter().filter(|a| a.is_orphan).collect();
    assert_eq!(3, orphans.len());
    assert!(orphans
        .iter()
        .all(|action| action.action == Action::Destroy));
    assert!(step_of(&plan, "group-x") < step_of(&plan, "group"));
    assert!(step_of(&plan, "group-y") < step_of(&plan, "group"));

    stack.apply(plan).await.unwrap();
    let mut journal = journal_of(&stack);
    journal.sort();
    assert_eq!(
        vec![
            "create c".to_owned(),
            "delete x:".to_owned(),
            "delete y:".to_owned()
        ],
        journal
    );

    // The bundle is gone from the state.
    let mut stack = Stack::new(&dir, Journal::default()).unwrap();
    let x = stack.resource("group-x", Widget::new("x")).unwrap();
    assert_eq!(Action::Create, x.action());
}
