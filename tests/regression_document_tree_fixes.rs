use dom_platform::{Document, Result};

#[test]
fn id_index_survives_subtree_moves() -> Result<()> {
    let document = Document::new();
    let section = document.create_element("section");
    let target = document.create_element("div");
    document.set_attribute(target, "id", "target")?;
    document.append_child(section, target)?;
    document.append_child(document.body(), section)?;
    assert_eq!(document.element_by_id("target"), Some(target));

    document.append_child(document.head(), section)?;
    assert_eq!(document.element_by_id("target"), Some(target));
    assert_eq!(document.parent_node(section), Some(document.head()));
    Ok(())
}

#[test]
fn removed_subtree_can_be_reinserted() -> Result<()> {
    let document = Document::new();
    let card = document.create_element("div");
    let title = document.create_element("span");
    document.set_attribute(title, "id", "title")?;
    document.set_text_content(title, Some("Card"))?;
    document.append_child(card, title)?;
    document.append_child(document.body(), card)?;
    assert_eq!(document.element_by_id("title"), Some(title));

    document.remove_child(document.body(), card)?;
    assert_eq!(document.element_by_id("title"), None);
    assert_eq!(
        document.outer_html(card),
        "<div><span id=\"title\">Card</span></div>"
    );

    document.append_child(document.body(), card)?;
    assert_eq!(document.element_by_id("title"), Some(title));
    assert_eq!(
        document.text_content(document.body()).as_deref(),
        Some("Card")
    );
    Ok(())
}

#[test]
fn moving_a_node_relative_to_its_siblings_keeps_the_list_consistent() -> Result<()> {
    let document = Document::new();
    let first = document.create_element("div");
    let second = document.create_element("span");
    let third = document.create_element("p");
    document.append_child(document.body(), first)?;
    document.append_child(document.body(), second)?;
    document.append_child(document.body(), third)?;

    // Move backwards: the reference index must be taken after the detach.
    document.insert_before(document.body(), second, Some(first))?;
    assert_eq!(
        document.children(document.body()),
        vec![second, first, third]
    );

    // Move forwards across its old slot.
    document.insert_before(document.body(), second, Some(third))?;
    assert_eq!(
        document.children(document.body()),
        vec![first, second, third]
    );
    Ok(())
}

#[test]
fn reappending_the_last_child_does_not_duplicate_it() -> Result<()> {
    let document = Document::new();
    let first = document.create_element("div");
    let second = document.create_element("span");
    document.append_child(document.body(), first)?;
    document.append_child(document.body(), second)?;
    document.append_child(document.body(), second)?;
    assert_eq!(document.children(document.body()), vec![first, second]);
    Ok(())
}

#[test]
fn set_text_content_drops_ids_from_replaced_children() -> Result<()> {
    let document = Document::new();
    let div = document.create_element("div");
    let span = document.create_element("span");
    document.set_attribute(span, "id", "inner")?;
    document.append_child(div, span)?;
    document.append_child(document.body(), div)?;
    assert_eq!(document.element_by_id("inner"), Some(span));

    document.set_text_content(div, Some("replaced"))?;
    assert_eq!(document.element_by_id("inner"), None);
    assert_eq!(document.parent_node(span), None);
    Ok(())
}

#[test]
fn deep_trees_serialize_without_overflowing_the_stack() -> Result<()> {
    let document = Document::new();
    let leaf = document.create_element("div");
    document.set_text_content(leaf, Some("deep"))?;
    let mut top = leaf;
    for _ in 0..50_000 {
        let parent = document.create_element("div");
        document.append_child(parent, top)?;
        top = parent;
    }
    document.append_child(document.body(), top)?;

    assert!(document.is_connected(leaf));
    let html = document.outer_html(document.body());
    assert!(html.starts_with("<body><div><div>"));
    assert!(html.ends_with("</div></div></body>"));
    assert_eq!(
        document.text_content(document.body()).as_deref(),
        Some("deep")
    );
    Ok(())
}
