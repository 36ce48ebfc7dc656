use std::collections::HashSet;

use dom_platform::{Document, NodeId, NodeKind, PlatformClient};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::{FileFailurePersistence, TestCaseResult};

const DOM_PROPTEST_REGRESSION_FILE: &str = "tests/proptest-regressions/dom_property_fuzz_test.txt";
const DEFAULT_DOM_PROPTEST_CASES: u32 = 128;

const TAG_NAMES: &[&str] = &["div", "span", "p", "section", "em", "label"];
const ATTR_NAMES: &[&str] = &["id", "class", "data-x", "title"];
const STYLE_NAMES: &[&str] = &["color", "fontSize", "margin-top", "background"];

#[derive(Clone, Debug)]
enum DomAction {
    CreateElement(usize),
    CreateText(String),
    CreateComment(String),
    Append {
        parent: usize,
        child: usize,
    },
    InsertBefore {
        parent: usize,
        child: usize,
        reference: Option<usize>,
    },
    Remove {
        parent: usize,
        child: usize,
    },
    SetText {
        target: usize,
        text: String,
    },
    SetAttr {
        target: usize,
        name: usize,
        value: String,
    },
    RemoveAttr {
        target: usize,
        name: usize,
    },
    SetStyle {
        target: usize,
        name: usize,
        value: String,
    },
}

fn env_proptest_cases(var_name: &str, default_cases: u32) -> u32 {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_cases)
}

fn dom_proptest_cases() -> u32 {
    std::env::var("DOM_PLATFORM_DOM_PROPTEST_CASES")
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or_else(|| {
            env_proptest_cases("DOM_PLATFORM_PROPTEST_CASES", DEFAULT_DOM_PROPTEST_CASES)
        })
}

fn small_text_strategy() -> BoxedStrategy<String> {
    vec(
        prop_oneof![
            Just('a'),
            Just('b'),
            Just('c'),
            Just('x'),
            Just('y'),
            Just('z'),
            Just('0'),
            Just('1'),
            Just(' '),
            Just('-'),
        ],
        0..=8,
    )
    .prop_map(|chars| chars.into_iter().collect())
    .boxed()
}

fn dom_action_strategy() -> BoxedStrategy<DomAction> {
    prop_oneof![
        3 => (0usize..TAG_NAMES.len()).prop_map(DomAction::CreateElement),
        2 => small_text_strategy().prop_map(DomAction::CreateText),
        1 => small_text_strategy().prop_map(DomAction::CreateComment),
        5 => (0usize..64, 0usize..64)
            .prop_map(|(parent, child)| DomAction::Append { parent, child }),
        3 => (0usize..64, 0usize..64, proptest::option::of(0usize..64))
            .prop_map(|(parent, child, reference)| DomAction::InsertBefore {
                parent,
                child,
                reference,
            }),
        2 => (0usize..64, 0usize..64)
            .prop_map(|(parent, child)| DomAction::Remove { parent, child }),
        2 => (0usize..64, small_text_strategy())
            .prop_map(|(target, text)| DomAction::SetText { target, text }),
        2 => (0usize..64, 0usize..ATTR_NAMES.len(), small_text_strategy())
            .prop_map(|(target, name, value)| DomAction::SetAttr { target, name, value }),
        1 => (0usize..64, 0usize..ATTR_NAMES.len())
            .prop_map(|(target, name)| DomAction::RemoveAttr { target, name }),
        2 => (0usize..64, 0usize..STYLE_NAMES.len(), small_text_strategy())
            .prop_map(|(target, name, value)| DomAction::SetStyle { target, name, value }),
    ]
    .boxed()
}

fn dom_action_sequence_strategy() -> BoxedStrategy<Vec<DomAction>> {
    vec(dom_action_strategy(), 1..=48).boxed()
}

fn pick(pool: &[NodeId], index: usize) -> NodeId {
    pool[index % pool.len()]
}

fn run_action(document: &Document, pool: &mut Vec<NodeId>, action: &DomAction) {
    match action {
        DomAction::CreateElement(tag) => {
            pool.push(document.create_element(TAG_NAMES[tag % TAG_NAMES.len()]));
        }
        DomAction::CreateText(text) => pool.push(document.create_text_node(text)),
        DomAction::CreateComment(text) => pool.push(document.create_comment(text)),
        DomAction::Append { parent, child } => {
            let _ = document.append_child(pick(pool, *parent), pick(pool, *child));
        }
        DomAction::InsertBefore {
            parent,
            child,
            reference,
        } => {
            let reference = reference.map(|index| pick(pool, index));
            let _ = document.insert_before(pick(pool, *parent), pick(pool, *child), reference);
        }
        DomAction::Remove { parent, child } => {
            let _ = document.remove_child(pick(pool, *parent), pick(pool, *child));
        }
        DomAction::SetText { target, text } => {
            let _ = document.set_text_content(pick(pool, *target), Some(text));
        }
        DomAction::SetAttr {
            target,
            name,
            value,
        } => {
            let _ = document.set_attribute(
                pick(pool, *target),
                ATTR_NAMES[name % ATTR_NAMES.len()],
                value,
            );
        }
        DomAction::RemoveAttr { target, name } => {
            let _ =
                document.remove_attribute(pick(pool, *target), ATTR_NAMES[name % ATTR_NAMES.len()]);
        }
        DomAction::SetStyle {
            target,
            name,
            value,
        } => {
            let _ = document.set_style_value(
                pick(pool, *target),
                STYLE_NAMES[name % STYLE_NAMES.len()],
                value,
            );
        }
    }
}

fn assert_tree_is_coherent(
    document: &Document,
    client: &PlatformClient,
    pool: &[NodeId],
) -> TestCaseResult {
    for node in pool {
        if let Some(parent) = document.parent_node(*node) {
            prop_assert!(
                document.children(parent).contains(node),
                "parent of {:?} does not list it as a child",
                node
            );
        }

        let children = document.children(*node);
        let unique: HashSet<NodeId> = children.iter().copied().collect();
        prop_assert_eq!(
            unique.len(),
            children.len(),
            "duplicate child under {:?}",
            node
        );
        for child in &children {
            prop_assert_eq!(
                document.parent_node(*child),
                Some(*node),
                "child {:?} does not point back at {:?}",
                child,
                node
            );
        }

        let mut cursor = Some(*node);
        let mut steps = 0usize;
        let mut reaches_root = false;
        while let Some(current) = cursor {
            if current == document.root() {
                reaches_root = true;
                break;
            }
            cursor = document.parent_node(current);
            steps += 1;
            prop_assert!(
                steps <= pool.len() + 8,
                "parent chain does not terminate for {:?}",
                node
            );
        }
        prop_assert_eq!(
            document.is_connected(*node),
            reaches_root,
            "connectivity report diverges for {:?}",
            node
        );

        let flags = [
            client.is_element(*node),
            client.is_text(*node),
            client.is_comment(*node),
        ];
        let set = flags.iter().filter(|flag| **flag).count();
        prop_assert!(set <= 1, "node {:?} matches several kinds", node);
        match document.node_kind(*node) {
            Some(NodeKind::Element) => prop_assert!(client.is_element(*node)),
            Some(NodeKind::Text) => prop_assert!(client.is_text(*node)),
            Some(NodeKind::Comment) => prop_assert!(client.is_comment(*node)),
            Some(NodeKind::Document) => prop_assert_eq!(set, 0),
            None => prop_assert!(false, "pool node {:?} has no kind", node),
        }

        if document.is_connected(*node) {
            if let Some(id) = document.attribute(*node, "id") {
                if !id.is_empty() {
                    let found = document.element_by_id(&id);
                    prop_assert!(found.is_some(), "connected id {:?} is not indexed", id);
                    if let Some(found) = found {
                        prop_assert!(document.is_connected(found));
                        let found_id = document.attribute(found, "id");
                        prop_assert_eq!(found_id.as_deref(), Some(id.as_str()));
                    }
                }
            }
        }
    }

    let _ = document.outer_html(document.root());
    let _ = document.text_content(document.body());
    for tag in TAG_NAMES {
        for element in document.elements_by_tag_name(tag) {
            prop_assert!(client.is_element(element));
        }
    }
    Ok(())
}

fn assert_dom_mutation_sequence_is_coherent(actions: &[DomAction]) -> TestCaseResult {
    let document = Document::new();
    let client = PlatformClient::new(document.clone());
    let mut pool = vec![
        document.root(),
        document.document_element(),
        document.head(),
        document.body(),
    ];

    for action in actions {
        run_action(&document, &mut pool, action);
    }

    assert_tree_is_coherent(&document, &client, &pool)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: dom_proptest_cases(),
        failure_persistence: Some(Box::new(
            FileFailurePersistence::Direct(DOM_PROPTEST_REGRESSION_FILE),
        )),
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_mutation_sequences_keep_the_tree_coherent(actions in dom_action_sequence_strategy()) {
        assert_dom_mutation_sequence_is_coherent(&actions)?;
    }
}
