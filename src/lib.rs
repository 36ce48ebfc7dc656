use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidNode(String),
    NotAnElement(String),
    NotAChild(String),
    InvalidMutation(String),
    InvalidArgument(String),
    StepLimit(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNode(msg) => write!(f, "invalid node: {msg}"),
            Self::NotAnElement(msg) => write!(f, "not an element: {msg}"),
            Self::NotAChild(msg) => write!(f, "not a child: {msg}"),
            Self::InvalidMutation(msg) => write!(f, "invalid mutation: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::StepLimit(msg) => write!(f, "step limit exceeded: {msg}"),
        }
    }
}

impl StdError for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Element = 1,
    Text = 3,
    Comment = 8,
    Document = 9,
}

impl NodeKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl PropertyValue {
    pub fn truthy(&self) -> bool {
        match self {
            Self::String(value) => !value.is_empty(),
            Self::Number(value) => *value != 0.0 && !value.is_nan(),
            Self::Bool(value) => *value,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Number(value) => format_float(*value),
            Self::Bool(value) => {
                if *value {
                    "true".into()
                } else {
                    "false".into()
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterDataRecord {
    pub target: NodeId,
    pub old_data: String,
    pub new_data: String,
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    namespace: Option<String>,
    attrs: HashMap<String, String>,
    props: HashMap<String, PropertyValue>,
}

impl Element {
    fn new(tag_name: &str, namespace: Option<&str>) -> Self {
        Self {
            tag_name: tag_name.to_string(),
            namespace: namespace.map(ToOwned::to_owned),
            attrs: HashMap::new(),
            props: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum NodeData {
    Document,
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

struct Observer {
    id: ObserverId,
    target: NodeId,
    callback: Rc<RefCell<dyn FnMut(CharacterDataRecord)>>,
}

enum Microtask {
    Job(Box<dyn FnOnce()>),
    Notify {
        observer: ObserverId,
        record: CharacterDataRecord,
    },
}

enum MicrotaskRun {
    Job(Box<dyn FnOnce()>),
    Notify(
        Rc<RefCell<dyn FnMut(CharacterDataRecord)>>,
        CharacterDataRecord,
    ),
    Skip,
}

struct ScheduledTask {
    id: i64,
    due_at: i64,
    order: i64,
    callback: Box<dyn FnOnce()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub id: i64,
    pub due_at: i64,
    pub order: i64,
}

struct DocumentState {
    nodes: Vec<Node>,
    root: NodeId,
    html: NodeId,
    head: NodeId,
    body: NodeId,
    id_index: HashMap<String, NodeId>,
    observers: Vec<Observer>,
    next_observer_id: usize,
    microtasks: VecDeque<Microtask>,
    microtask_step_limit: usize,
    task_queue: Vec<ScheduledTask>,
    now_ms: i64,
    timer_step_limit: usize,
    next_timer_id: i64,
    next_task_order: i64,
    trace: bool,
    trace_dom: bool,
    trace_scheduler: bool,
    trace_logs: Vec<String>,
    trace_log_limit: usize,
    trace_to_stderr: bool,
}

impl DocumentState {
    const TREE_WALK_STACK_RED_ZONE: usize = 64 * 1024;
    const TREE_WALK_STACK_SIZE: usize = 32 * 1024 * 1024;

    fn new() -> Self {
        let mut state = Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                data: NodeData::Document,
            }],
            root: NodeId(0),
            html: NodeId(0),
            head: NodeId(0),
            body: NodeId(0),
            id_index: HashMap::new(),
            observers: Vec::new(),
            next_observer_id: 1,
            microtasks: VecDeque::new(),
            microtask_step_limit: 10_000,
            task_queue: Vec::new(),
            now_ms: 0,
            timer_step_limit: 10_000,
            next_timer_id: 1,
            next_task_order: 0,
            trace: false,
            trace_dom: true,
            trace_scheduler: true,
            trace_logs: Vec::new(),
            trace_log_limit: 10_000,
            trace_to_stderr: true,
        };
        let root = state.root;
        let html = state.create_node(Some(root), NodeData::Element(Element::new("html", None)));
        let head = state.create_node(Some(html), NodeData::Element(Element::new("head", None)));
        let body = state.create_node(Some(html), NodeData::Element(Element::new("body", None)));
        state.html = html;
        state.head = head;
        state.body = body;
        state
    }

    fn create_node(&mut self, parent: Option<NodeId>, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            data,
        });
        if let Some(parent_id) = parent {
            self.nodes[parent_id.0].children.push(id);
        }
        id
    }

    fn element(&self, node_id: NodeId) -> Option<&Element> {
        match self.nodes.get(node_id.0).map(|node| &node.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node_id: NodeId) -> Option<&mut Element> {
        match self.nodes.get_mut(node_id.0).map(|node| &mut node.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn kind(&self, node_id: NodeId) -> Option<NodeKind> {
        self.nodes.get(node_id.0).map(|node| match &node.data {
            NodeData::Document => NodeKind::Document,
            NodeData::Element(_) => NodeKind::Element,
            NodeData::Text(_) => NodeKind::Text,
            NodeData::Comment(_) => NodeKind::Comment,
        })
    }

    fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes.get(node_id.0).and_then(|node| node.parent)
    }

    fn by_id(&self, id: &str) -> Option<NodeId> {
        self.id_index.get(id).copied()
    }

    fn can_have_children(&self, node_id: NodeId) -> bool {
        matches!(
            self.nodes.get(node_id.0).map(|node| &node.data),
            Some(NodeData::Document | NodeData::Element(_))
        )
    }

    fn is_valid_node(&self, node_id: NodeId) -> bool {
        node_id.0 < self.nodes.len()
    }

    fn is_connected(&self, node_id: NodeId) -> bool {
        if !self.is_valid_node(node_id) {
            return false;
        }
        let mut cursor = Some(node_id);
        while let Some(node) = cursor {
            if node == self.root {
                return true;
            }
            cursor = self.parent(node);
        }
        false
    }

    fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
        op: &str,
    ) -> Result<()> {
        if !self.is_valid_node(parent) || !self.is_valid_node(child) {
            return Err(Error::InvalidNode(format!("{op} node is invalid")));
        }
        if !self.can_have_children(parent) {
            return Err(Error::InvalidMutation(format!(
                "{op} target cannot have children"
            )));
        }
        if child == self.root || child == parent {
            return Err(Error::InvalidMutation(format!("invalid {op} node")));
        }
        if let Some(reference) = reference {
            if !self.is_valid_node(reference) {
                return Err(Error::InvalidNode(format!("{op} reference is invalid")));
            }
            if self.parent(reference) != Some(parent) {
                return Err(Error::NotAChild(format!(
                    "{op} reference is not a direct child"
                )));
            }
            if child == reference {
                return Ok(());
            }
        }

        // Prevent cycles: parent must not be inside child's subtree.
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node == child {
                return Err(Error::InvalidMutation(format!("{op} would create a cycle")));
            }
            cursor = self.parent(node);
        }

        if let Some(old_parent) = self.parent(child) {
            self.nodes[old_parent.0].children.retain(|id| *id != child);
        }

        let index = match reference {
            Some(reference) => {
                let Some(index) = self.nodes[parent.0]
                    .children
                    .iter()
                    .position(|id| *id == reference)
                else {
                    return Err(Error::NotAChild(format!("{op} reference is missing")));
                };
                index
            }
            None => self.nodes[parent.0].children.len(),
        };

        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(index, child);
        self.rebuild_id_index();
        self.trace_dom_line(format!(
            "[dom] {op} parent={} child={} index={}",
            parent.0, child.0, index
        ));
        Ok(())
    }

    fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if !self.is_valid_node(parent) || !self.is_valid_node(child) {
            return Err(Error::InvalidNode("removeChild node is invalid".into()));
        }
        if self.parent(child) != Some(parent) {
            return Err(Error::NotAChild(
                "removeChild target is not a direct child".into(),
            ));
        }
        self.nodes[parent.0].children.retain(|id| *id != child);
        self.nodes[child.0].parent = None;
        self.rebuild_id_index();
        self.trace_dom_line(format!(
            "[dom] removeChild parent={} child={}",
            parent.0, child.0
        ));
        Ok(())
    }

    fn rebuild_id_index(&mut self) {
        let mut next = HashMap::new();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            match &self.nodes[node.0].data {
                NodeData::Element(element) => {
                    if let Some(id) = element.attrs.get("id") {
                        if !id.is_empty() {
                            next.insert(id.clone(), node);
                        }
                    }
                }
                NodeData::Document | NodeData::Text(_) | NodeData::Comment(_) => {}
            }
            for child in self.nodes[node.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        self.id_index = next;
    }

    fn collect_elements_dfs(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        stacker::maybe_grow(
            Self::TREE_WALK_STACK_RED_ZONE,
            Self::TREE_WALK_STACK_SIZE,
            || {
                let Some(node) = self.nodes.get(node_id.0) else {
                    return;
                };
                if matches!(node.data, NodeData::Element(_)) {
                    out.push(node_id);
                }
                for child in &node.children {
                    self.collect_elements_dfs(*child, out);
                }
            },
        )
    }

    fn collect_elements_descendants_dfs(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        let Some(node) = self.nodes.get(node_id.0) else {
            return;
        };
        for child in &node.children {
            self.collect_elements_dfs(*child, out);
        }
    }

    fn text_content(&self, node_id: NodeId) -> Option<String> {
        match self.nodes.get(node_id.0).map(|node| &node.data) {
            None | Some(NodeData::Document) => None,
            Some(NodeData::Text(value)) | Some(NodeData::Comment(value)) => Some(value.clone()),
            Some(NodeData::Element(_)) => {
                let mut out = String::new();
                self.collect_text(node_id, &mut out);
                Some(out)
            }
        }
    }

    fn collect_text(&self, node_id: NodeId, out: &mut String) {
        stacker::maybe_grow(
            Self::TREE_WALK_STACK_RED_ZONE,
            Self::TREE_WALK_STACK_SIZE,
            || {
                for child in &self.nodes[node_id.0].children {
                    match &self.nodes[child.0].data {
                        NodeData::Text(value) => out.push_str(value),
                        // Comment data never joins an element's text content.
                        NodeData::Comment(_) => {}
                        NodeData::Element(_) | NodeData::Document => {
                            self.collect_text(*child, out);
                        }
                    }
                }
            },
        )
    }

    fn set_text_content(&mut self, node_id: NodeId, value: &str) -> Result<()> {
        match self.nodes.get(node_id.0).map(|node| &node.data) {
            Some(NodeData::Element(_)) => {
                let old_children = std::mem::take(&mut self.nodes[node_id.0].children);
                for child in old_children {
                    self.nodes[child.0].parent = None;
                }
                if !value.is_empty() {
                    self.create_node(Some(node_id), NodeData::Text(value.to_string()));
                }
                self.rebuild_id_index();
                self.trace_dom_line(format!("[dom] text node={} len={}", node_id.0, value.len()));
                Ok(())
            }
            Some(NodeData::Text(_)) | Some(NodeData::Comment(_)) => {
                self.set_character_data(node_id, value)
            }
            Some(NodeData::Document) => Err(Error::InvalidMutation(
                "textContent target cannot be the document".into(),
            )),
            None => Err(Error::InvalidNode("textContent node is invalid".into())),
        }
    }

    fn set_character_data(&mut self, node_id: NodeId, data: &str) -> Result<()> {
        let old = match self.nodes.get_mut(node_id.0).map(|node| &mut node.data) {
            Some(NodeData::Text(value)) | Some(NodeData::Comment(value)) => {
                std::mem::replace(value, data.to_string())
            }
            Some(_) => {
                return Err(Error::InvalidMutation(
                    "characterData target is not a text or comment node".into(),
                ));
            }
            None => {
                return Err(Error::InvalidNode("characterData node is invalid".into()));
            }
        };
        self.trace_dom_line(format!("[dom] data node={} len={}", node_id.0, data.len()));

        let watchers = self
            .observers
            .iter()
            .filter(|entry| entry.target == node_id)
            .map(|entry| entry.id)
            .collect::<Vec<_>>();
        for observer in watchers {
            self.microtasks.push_back(Microtask::Notify {
                observer,
                record: CharacterDataRecord {
                    target: node_id,
                    old_data: old.clone(),
                    new_data: data.to_string(),
                },
            });
            self.trace_scheduler_line(format!(
                "[tick] schedule notify observer={} target={}",
                observer.0, node_id.0
            ));
        }
        Ok(())
    }

    fn attr(&self, node_id: NodeId, name: &str) -> Option<String> {
        self.element(node_id)
            .and_then(|element| element.attrs.get(&name.to_ascii_lowercase()).cloned())
    }

    fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        let lowered = {
            let element = self.element_mut(node_id).ok_or_else(|| {
                Error::NotAnElement("setAttribute target is not an element".into())
            })?;
            let lowered = name.to_ascii_lowercase();
            element.attrs.insert(lowered.clone(), value.to_string());
            lowered
        };

        if lowered == "id" && self.is_connected(node_id) {
            self.rebuild_id_index();
        }
        self.trace_dom_line(format!(
            "[dom] attr node={} name={lowered} value={value}",
            node_id.0
        ));
        Ok(())
    }

    fn remove_attr(&mut self, node_id: NodeId, name: &str) -> Result<()> {
        let lowered = name.to_ascii_lowercase();
        {
            let element = self.element_mut(node_id).ok_or_else(|| {
                Error::NotAnElement("removeAttribute target is not an element".into())
            })?;
            element.attrs.remove(&lowered);
        }

        if lowered == "id" && self.is_connected(node_id) {
            self.rebuild_id_index();
        }
        self.trace_dom_line(format!(
            "[dom] attr node={} name={lowered} value=",
            node_id.0
        ));
        Ok(())
    }

    fn prop(&self, node_id: NodeId, name: &str) -> Option<PropertyValue> {
        match self.nodes.get(node_id.0).map(|node| &node.data) {
            Some(NodeData::Element(element)) => element.props.get(name).cloned(),
            Some(NodeData::Text(value)) | Some(NodeData::Comment(value)) if name == "data" => {
                Some(PropertyValue::String(value.clone()))
            }
            _ => None,
        }
    }

    fn set_prop(&mut self, node_id: NodeId, name: &str, value: PropertyValue) -> Result<()> {
        match self.nodes.get(node_id.0).map(|node| &node.data) {
            Some(NodeData::Element(_)) => {
                let rendered = value.as_string();
                if let Some(element) = self.element_mut(node_id) {
                    element.props.insert(name.to_string(), value);
                }
                self.trace_dom_line(format!(
                    "[dom] prop node={} name={name} value={rendered}",
                    node_id.0
                ));
                Ok(())
            }
            Some(NodeData::Text(_)) | Some(NodeData::Comment(_)) if name == "data" => match value {
                PropertyValue::String(text) => self.set_character_data(node_id, &text),
                _ => Err(Error::InvalidMutation(
                    "data property requires a string value".into(),
                )),
            },
            Some(_) => Err(Error::NotAnElement(
                "property target is not an element".into(),
            )),
            None => Err(Error::InvalidNode("property node is invalid".into())),
        }
    }

    fn style_get(&self, node_id: NodeId, key: &str) -> Option<String> {
        let element = self.element(node_id)?;
        let name = css_property_name(key);
        let decls = parse_style_declarations(element.attrs.get("style").map(String::as_str));
        decls
            .iter()
            .find(|(prop, _)| prop == &name)
            .map(|(_, value)| value.clone())
    }

    fn style_set(&mut self, node_id: NodeId, key: &str, value: &str) -> Result<()> {
        let name = css_property_name(key);
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::NotAnElement("style target is not an element".into()))?;

        let mut decls = parse_style_declarations(element.attrs.get("style").map(String::as_str));
        if let Some(pos) = decls.iter().position(|(prop, _)| prop == &name) {
            if value.is_empty() {
                decls.remove(pos);
            } else {
                decls[pos].1 = value.to_string();
            }
        } else if !value.is_empty() {
            decls.push((name.clone(), value.to_string()));
        }

        if decls.is_empty() {
            element.attrs.remove("style");
        } else {
            element
                .attrs
                .insert("style".to_string(), serialize_style_declarations(&decls));
        }
        self.trace_dom_line(format!(
            "[style] set node={} name={name} value={value}",
            node_id.0
        ));
        Ok(())
    }

    fn dump_node(&self, node_id: NodeId) -> String {
        stacker::maybe_grow(
            Self::TREE_WALK_STACK_RED_ZONE,
            Self::TREE_WALK_STACK_SIZE,
            || self.dump_node_impl(node_id),
        )
    }

    fn dump_node_impl(&self, node_id: NodeId) -> String {
        let Some(node) = self.nodes.get(node_id.0) else {
            return String::new();
        };
        match &node.data {
            NodeData::Document => {
                let mut out = String::new();
                for child in &node.children {
                    out.push_str(&self.dump_node(*child));
                }
                out
            }
            NodeData::Text(text) => text.clone(),
            NodeData::Comment(text) => format!("<!--{text}-->"),
            NodeData::Element(element) => {
                let mut out = String::new();
                out.push('<');
                out.push_str(&element.tag_name);
                let mut attrs = element.attrs.iter().collect::<Vec<_>>();
                attrs.sort_by(|a, b| a.0.cmp(b.0));
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(value);
                    out.push('"');
                }
                out.push('>');
                for child in &node.children {
                    out.push_str(&self.dump_node(*child));
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
                out
            }
        }
    }

    fn next_task_index(&self, due_limit: Option<i64>) -> Option<usize> {
        self.task_queue
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                if let Some(limit) = due_limit {
                    task.due_at <= limit
                } else {
                    true
                }
            })
            .min_by_key(|(_, task)| (task.due_at, task.order))
            .map(|(idx, _)| idx)
    }

    fn timer_step_limit_error(
        &self,
        max_steps: usize,
        steps: usize,
        due_limit: Option<i64>,
    ) -> Error {
        let due_limit_desc = due_limit
            .map(|value| value.to_string())
            .unwrap_or_else(|| "none".into());

        let next_task_desc = self
            .next_task_index(due_limit)
            .and_then(|idx| self.task_queue.get(idx))
            .map(|task| format!("id={},due_at={},order={}", task.id, task.due_at, task.order))
            .unwrap_or_else(|| "none".into());

        Error::StepLimit(format!(
            "flush exceeded max task steps (possible self-rescheduling timeout): limit={max_steps}, steps={steps}, now_ms={}, due_limit={}, pending_tasks={}, next_task={}",
            self.now_ms,
            due_limit_desc,
            self.task_queue.len(),
            next_task_desc
        ))
    }

    fn trace_dom_line(&mut self, line: String) {
        if self.trace && self.trace_dom {
            self.trace_line(line);
        }
    }

    fn trace_scheduler_line(&mut self, line: String) {
        if self.trace && self.trace_scheduler {
            self.trace_line(line);
        }
    }

    fn trace_line(&mut self, line: String) {
        if self.trace {
            if self.trace_to_stderr {
                eprintln!("{line}");
            }
            if self.trace_logs.len() >= self.trace_log_limit {
                self.trace_logs.remove(0);
            }
            self.trace_logs.push(line);
        }
    }
}

#[derive(Clone)]
pub struct Document {
    state: Rc<RefCell<DocumentState>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(DocumentState::new())),
        }
    }

    pub fn root(&self) -> NodeId {
        self.state.borrow().root
    }

    pub fn document_element(&self) -> NodeId {
        self.state.borrow().html
    }

    pub fn head(&self) -> NodeId {
        self.state.borrow().head
    }

    pub fn body(&self) -> NodeId {
        self.state.borrow().body
    }

    pub fn create_element(&self, tag_name: &str) -> NodeId {
        let mut state = self.state.borrow_mut();
        let tag = tag_name.to_ascii_lowercase();
        let node = state.create_node(None, NodeData::Element(Element::new(&tag, None)));
        let line = format!("[dom] create element node={} tag={tag}", node.0);
        state.trace_dom_line(line);
        node
    }

    pub fn create_element_ns(&self, namespace_uri: &str, qualified_name: &str) -> NodeId {
        let mut state = self.state.borrow_mut();
        let node = state.create_node(
            None,
            NodeData::Element(Element::new(qualified_name, Some(namespace_uri))),
        );
        let line = format!(
            "[dom] create element node={} tag={qualified_name} ns={namespace_uri}",
            node.0
        );
        state.trace_dom_line(line);
        node
    }

    pub fn create_text_node(&self, text: &str) -> NodeId {
        let mut state = self.state.borrow_mut();
        let node = state.create_node(None, NodeData::Text(text.to_string()));
        let line = format!("[dom] create text node={} len={}", node.0, text.len());
        state.trace_dom_line(line);
        node
    }

    pub fn create_comment(&self, text: &str) -> NodeId {
        let mut state = self.state.borrow_mut();
        let node = state.create_node(None, NodeData::Comment(text.to_string()));
        let line = format!("[dom] create comment node={} len={}", node.0, text.len());
        state.trace_dom_line(line);
        node
    }

    pub fn node_kind(&self, node: NodeId) -> Option<NodeKind> {
        self.state.borrow().kind(node)
    }

    pub fn tag_name(&self, node: NodeId) -> Option<String> {
        let state = self.state.borrow();
        state.element(node).map(|element| element.tag_name.clone())
    }

    pub fn namespace_uri(&self, node: NodeId) -> Option<String> {
        let state = self.state.borrow();
        state
            .element(node)
            .and_then(|element| element.namespace.clone())
    }

    pub fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        self.state.borrow().parent(node)
    }

    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let state = self.state.borrow();
        let parent = state.parent(node)?;
        let children = &state.nodes[parent.0].children;
        let pos = children.iter().position(|id| *id == node)?;
        children.get(pos + 1).copied()
    }

    pub fn first_child(&self, node: NodeId) -> Option<NodeId> {
        let state = self.state.borrow();
        state
            .nodes
            .get(node.0)
            .and_then(|entry| entry.children.first().copied())
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        let state = self.state.borrow();
        state
            .nodes
            .get(node.0)
            .map(|entry| entry.children.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.state.borrow().is_connected(node)
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.state
            .borrow_mut()
            .insert_before(parent, child, None, "appendChild")
    }

    pub fn insert_before(
        &self,
        parent: NodeId,
        new_node: NodeId,
        reference_node: Option<NodeId>,
    ) -> Result<()> {
        self.state
            .borrow_mut()
            .insert_before(parent, new_node, reference_node, "insertBefore")
    }

    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.state.borrow_mut().remove_child(parent, child)
    }

    pub fn text_content(&self, node: NodeId) -> Option<String> {
        self.state.borrow().text_content(node)
    }

    pub fn set_text_content(&self, node: NodeId, text: Option<&str>) -> Result<()> {
        self.state
            .borrow_mut()
            .set_text_content(node, text.unwrap_or_default())
    }

    pub fn character_data(&self, node: NodeId) -> Option<String> {
        let state = self.state.borrow();
        match state.nodes.get(node.0).map(|entry| &entry.data) {
            Some(NodeData::Text(value)) | Some(NodeData::Comment(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set_character_data(&self, node: NodeId, data: &str) -> Result<()> {
        self.state.borrow_mut().set_character_data(node, data)
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.state.borrow().attr(node, name)
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<()> {
        self.state.borrow_mut().set_attr(node, name, value)
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) -> Result<()> {
        self.state.borrow_mut().remove_attr(node, name)
    }

    pub fn property(&self, node: NodeId, name: &str) -> Option<PropertyValue> {
        self.state.borrow().prop(node, name)
    }

    pub fn set_property(&self, node: NodeId, name: &str, value: PropertyValue) -> Result<()> {
        self.state.borrow_mut().set_prop(node, name, value)
    }

    pub fn style_value(&self, node: NodeId, style_name: &str) -> Option<String> {
        self.state.borrow().style_get(node, style_name)
    }

    pub fn set_style_value(&self, node: NodeId, style_name: &str, style_value: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .style_set(node, style_name, style_value)
    }

    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.state.borrow().by_id(id)
    }

    pub fn element_by_id_within(&self, scope: NodeId, id: &str) -> Option<NodeId> {
        if id.is_empty() {
            return None;
        }
        let state = self.state.borrow();
        let mut out = Vec::new();
        state.collect_elements_descendants_dfs(scope, &mut out);
        out.into_iter().find(|node| {
            state
                .element(*node)
                .and_then(|element| element.attrs.get("id"))
                .map(|value| value == id)
                .unwrap_or(false)
        })
    }

    pub fn elements_by_tag_name(&self, tag_name: &str) -> Vec<NodeId> {
        let state = self.state.borrow();
        let mut out = Vec::new();
        state.collect_elements_dfs(state.root, &mut out);
        out.into_iter()
            .filter(|node| {
                state
                    .element(*node)
                    .map(|element| element.tag_name.eq_ignore_ascii_case(tag_name))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn outer_html(&self, node: NodeId) -> String {
        self.state.borrow().dump_node(node)
    }

    pub fn observe_character_data<F>(&self, target: NodeId, callback: F) -> ObserverId
    where
        F: FnMut(CharacterDataRecord) + 'static,
    {
        let mut state = self.state.borrow_mut();
        let id = ObserverId(state.next_observer_id);
        state.next_observer_id += 1;
        state.observers.push(Observer {
            id,
            target,
            callback: Rc::new(RefCell::new(callback)),
        });
        let line = format!("[tick] observe id={} target={}", id.0, target.0);
        state.trace_scheduler_line(line);
        id
    }

    pub fn disconnect_observer(&self, observer: ObserverId) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.observers.len();
        state.observers.retain(|entry| entry.id != observer);
        let removed = before != state.observers.len();
        let line = format!("[tick] disconnect id={} removed={removed}", observer.0);
        state.trace_scheduler_line(line);
        removed
    }

    pub fn queue_microtask<F>(&self, job: F)
    where
        F: FnOnce() + 'static,
    {
        let mut state = self.state.borrow_mut();
        state.microtasks.push_back(Microtask::Job(Box::new(job)));
        let pending = state.microtasks.len();
        state.trace_scheduler_line(format!("[tick] schedule job pending={pending}"));
    }

    pub fn pending_microtasks(&self) -> usize {
        self.state.borrow().microtasks.len()
    }

    pub fn run_microtasks(&self) -> Result<usize> {
        let mut steps = 0usize;
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                if state.microtasks.is_empty() {
                    break;
                }
                steps += 1;
                if steps > state.microtask_step_limit {
                    let limit = state.microtask_step_limit;
                    let pending = state.microtasks.len();
                    return Err(Error::StepLimit(format!(
                        "microtask drain exceeded max steps (possible self-queueing job): limit={limit}, steps={steps}, pending={pending}"
                    )));
                }
                match state.microtasks.pop_front() {
                    Some(Microtask::Job(job)) => {
                        state.trace_scheduler_line("[tick] run job".into());
                        MicrotaskRun::Job(job)
                    }
                    Some(Microtask::Notify { observer, record }) => {
                        let callback = state
                            .observers
                            .iter()
                            .find(|entry| entry.id == observer)
                            .map(|entry| Rc::clone(&entry.callback));
                        match callback {
                            Some(callback) => {
                                let line = format!(
                                    "[tick] notify observer={} target={}",
                                    observer.0, record.target.0
                                );
                                state.trace_scheduler_line(line);
                                MicrotaskRun::Notify(callback, record)
                            }
                            None => {
                                let line = format!(
                                    "[tick] drop notify observer={} (disconnected)",
                                    observer.0
                                );
                                state.trace_scheduler_line(line);
                                MicrotaskRun::Skip
                            }
                        }
                    }
                    None => break,
                }
            };
            match next {
                MicrotaskRun::Job(job) => job(),
                MicrotaskRun::Notify(callback, record) => {
                    // A notification landing while the same observer is already
                    // running is dropped instead of re-entering it.
                    if let Ok(mut guard) = callback.try_borrow_mut() {
                        (&mut *guard)(record);
                    }
                }
                MicrotaskRun::Skip => {}
            }
        }
        Ok(steps)
    }

    pub fn set_timeout<F>(&self, callback: F, delay_ms: i64) -> i64
    where
        F: FnOnce() + 'static,
    {
        let mut state = self.state.borrow_mut();
        let delay_ms = delay_ms.max(0);
        let due_at = state.now_ms.saturating_add(delay_ms);
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        let order = state.next_task_order;
        state.next_task_order += 1;
        state.task_queue.push(ScheduledTask {
            id,
            due_at,
            order,
            callback: Box::new(callback),
        });
        state.trace_scheduler_line(format!(
            "[timer] schedule timeout id={id} due_at={due_at} delay_ms={delay_ms}"
        ));
        id
    }

    pub fn clear_timeout(&self, timer_id: i64) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.task_queue.len();
        state.task_queue.retain(|task| task.id != timer_id);
        let removed = before.saturating_sub(state.task_queue.len());
        state.trace_scheduler_line(format!("[timer] clear id={timer_id} removed={removed}"));
        removed > 0
    }

    pub fn pending_timers(&self) -> Vec<PendingTimer> {
        let state = self.state.borrow();
        let mut timers = state
            .task_queue
            .iter()
            .map(|task| PendingTimer {
                id: task.id,
                due_at: task.due_at,
                order: task.order,
            })
            .collect::<Vec<_>>();
        timers.sort_by_key(|timer| (timer.due_at, timer.order));
        timers
    }

    pub fn now_ms(&self) -> i64 {
        self.state.borrow().now_ms
    }

    pub fn advance_time(&self, delta_ms: i64) -> Result<()> {
        if delta_ms < 0 {
            return Err(Error::InvalidArgument(
                "advance_time requires non-negative milliseconds".into(),
            ));
        }
        let from = {
            let mut state = self.state.borrow_mut();
            let from = state.now_ms;
            state.now_ms = state.now_ms.saturating_add(delta_ms);
            from
        };
        let ran = self.run_due_timers_internal()?;
        let mut state = self.state.borrow_mut();
        let line = format!(
            "[timer] advance delta_ms={} from={} to={} ran_due={}",
            delta_ms, from, state.now_ms, ran
        );
        state.trace_scheduler_line(line);
        Ok(())
    }

    pub fn advance_time_to(&self, target_ms: i64) -> Result<()> {
        let from = {
            let mut state = self.state.borrow_mut();
            if target_ms < state.now_ms {
                return Err(Error::InvalidArgument(format!(
                    "advance_time_to requires target >= now_ms (target={target_ms}, now_ms={})",
                    state.now_ms
                )));
            }
            let from = state.now_ms;
            state.now_ms = target_ms;
            from
        };
        let ran = self.run_due_timers_internal()?;
        let mut state = self.state.borrow_mut();
        let line = format!(
            "[timer] advance_to from={} to={} ran_due={}",
            from, state.now_ms, ran
        );
        state.trace_scheduler_line(line);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let from = self.now_ms();
        let ran = self.run_timer_queue(None, true)?;
        let mut state = self.state.borrow_mut();
        let line = format!(
            "[timer] flush from={} to={} ran={}",
            from, state.now_ms, ran
        );
        state.trace_scheduler_line(line);
        Ok(())
    }

    pub fn run_due_timers(&self) -> Result<usize> {
        let ran = self.run_due_timers_internal()?;
        let mut state = self.state.borrow_mut();
        let line = format!("[timer] run_due now_ms={} ran={}", state.now_ms, ran);
        state.trace_scheduler_line(line);
        Ok(ran)
    }

    pub fn run_next_timer(&self) -> Result<bool> {
        self.run_microtasks()?;
        let task = {
            let mut state = self.state.borrow_mut();
            let Some(next_idx) = state.next_task_index(None) else {
                state.trace_scheduler_line("[timer] run_next none".into());
                return Ok(false);
            };
            let task = state.task_queue.remove(next_idx);
            if task.due_at > state.now_ms {
                state.now_ms = task.due_at;
            }
            let line = format!(
                "[timer] run id={} due_at={} now_ms={}",
                task.id, task.due_at, state.now_ms
            );
            state.trace_scheduler_line(line);
            task
        };
        (task.callback)();
        self.run_microtasks()?;
        Ok(true)
    }

    fn run_due_timers_internal(&self) -> Result<usize> {
        let due_limit = Some(self.now_ms());
        self.run_timer_queue(due_limit, false)
    }

    // Microtasks drain before the first timer task and after every one, so a
    // queued tick always runs ahead of timer work scheduled alongside it.
    fn run_timer_queue(&self, due_limit: Option<i64>, advance_clock: bool) -> Result<usize> {
        let mut steps = 0usize;
        self.run_microtasks()?;
        loop {
            let task = {
                let mut state = self.state.borrow_mut();
                let Some(next_idx) = state.next_task_index(due_limit) else {
                    break;
                };
                steps += 1;
                if steps > state.timer_step_limit {
                    let limit = state.timer_step_limit;
                    return Err(state.timer_step_limit_error(limit, steps, due_limit));
                }
                let task = state.task_queue.remove(next_idx);
                if advance_clock && task.due_at > state.now_ms {
                    state.now_ms = task.due_at;
                }
                let line = format!(
                    "[timer] run id={} due_at={} now_ms={}",
                    task.id, task.due_at, state.now_ms
                );
                state.trace_scheduler_line(line);
                task
            };
            (task.callback)();
            self.run_microtasks()?;
        }
        Ok(steps)
    }

    pub fn enable_trace(&self, enabled: bool) {
        self.state.borrow_mut().trace = enabled;
    }

    pub fn take_trace_logs(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().trace_logs)
    }

    pub fn set_trace_stderr(&self, enabled: bool) {
        self.state.borrow_mut().trace_to_stderr = enabled;
    }

    pub fn set_trace_dom(&self, enabled: bool) {
        self.state.borrow_mut().trace_dom = enabled;
    }

    pub fn set_trace_scheduler(&self, enabled: bool) {
        self.state.borrow_mut().trace_scheduler = enabled;
    }

    pub fn set_trace_log_limit(&self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::InvalidArgument(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        let mut state = self.state.borrow_mut();
        state.trace_log_limit = max_entries;
        while state.trace_logs.len() > state.trace_log_limit {
            state.trace_logs.remove(0);
        }
        Ok(())
    }

    pub fn set_timer_step_limit(&self, max_steps: usize) -> Result<()> {
        if max_steps == 0 {
            return Err(Error::InvalidArgument(
                "set_timer_step_limit requires at least 1 step".into(),
            ));
        }
        self.state.borrow_mut().timer_step_limit = max_steps;
        Ok(())
    }

    pub fn set_microtask_step_limit(&self, max_steps: usize) -> Result<()> {
        if max_steps == 0 {
            return Err(Error::InvalidArgument(
                "set_microtask_step_limit requires at least 1 step".into(),
            ));
        }
        self.state.borrow_mut().microtask_step_limit = max_steps;
        Ok(())
    }

    fn trace_style_line(&self, line: String) {
        self.state.borrow_mut().trace_dom_line(line);
    }
}

pub struct PlatformClient {
    document: Document,
    css: HashSet<String>,
}

impl PlatformClient {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            css: HashSet::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn create_element(&self, tag_name: &str) -> NodeId {
        self.document.create_element(tag_name)
    }

    pub fn create_element_ns(&self, namespace_uri: &str, qualified_name: &str) -> NodeId {
        self.document
            .create_element_ns(namespace_uri, qualified_name)
    }

    pub fn create_text_node(&self, text: &str) -> NodeId {
        self.document.create_text_node(text)
    }

    pub fn create_comment(&self, text: &str) -> NodeId {
        self.document.create_comment(text)
    }

    pub fn insert_before(
        &self,
        parent: NodeId,
        new_node: NodeId,
        reference_node: Option<NodeId>,
    ) -> Result<()> {
        self.document.insert_before(parent, new_node, reference_node)
    }

    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.document.remove_child(parent, child)
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.document.append_child(parent, child)
    }

    pub fn parent_node(&self, node: NodeId) -> Option<NodeId> {
        self.document.parent_node(node)
    }

    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        self.document.next_sibling(node)
    }

    pub fn tag(&self, node: NodeId) -> String {
        self.document
            .tag_name(node)
            .map(|tag| tag.to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn set_text_content(&self, node: NodeId, text: Option<&str>) -> Result<()> {
        self.document.set_text_content(node, text)
    }

    pub fn get_text_content(&self, node: NodeId) -> Option<String> {
        self.document.text_content(node)
    }

    pub fn get_attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.document.attribute(node, name)
    }

    pub fn get_property(&self, node: NodeId, name: &str) -> Option<PropertyValue> {
        self.document.property(node, name)
    }

    pub fn get_prop_or_attr(&self, node: NodeId, name: &str) -> Option<PropertyValue> {
        match self.document.property(node, &to_camel_case(name)) {
            Some(value) => Some(value),
            None => self
                .document
                .attribute(node, name)
                .map(PropertyValue::String),
        }
    }

    pub fn set_style(&self, node: NodeId, style_name: &str, style_value: &str) -> Result<()> {
        self.document.set_style_value(node, style_name, style_value)
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.document.node_kind(node) == Some(NodeKind::Element)
    }

    pub fn is_text(&self, node: NodeId) -> bool {
        self.document.node_kind(node) == Some(NodeKind::Text)
    }

    pub fn is_comment(&self, node: NodeId) -> bool {
        self.document.node_kind(node) == Some(NodeKind::Comment)
    }

    pub fn has_element_css(&self, tag_name: &str) -> bool {
        self.css.contains(tag_name)
    }

    pub fn append_styles(&mut self, tag_name: &str, styles: &str) -> Result<()> {
        // The tag is marked as handled before the content check: an empty
        // sheet still counts.
        self.css.insert(tag_name.to_string());
        if styles.is_empty() {
            return Ok(());
        }
        let css_id = format!("css-{tag_name}");
        let head = self.document.head();
        if self.document.element_by_id_within(head, &css_id).is_some() {
            self.document
                .trace_style_line(format!("[style] skip tag={tag_name} id={css_id}"));
            return Ok(());
        }
        let style = self.document.create_element("style");
        self.document.set_attribute(style, "id", &css_id)?;
        self.document.set_text_content(style, Some(styles))?;
        let first = self.document.first_child(head);
        self.document.insert_before(head, style, first)?;
        self.document.trace_style_line(format!(
            "[style] inject tag={tag_name} id={css_id} kind=style"
        ));
        Ok(())
    }

    pub fn append_style_url(&mut self, tag_name: &str, style_url: &str) -> Result<()> {
        self.css.insert(tag_name.to_string());
        if style_url.is_empty() {
            return Ok(());
        }
        let css_id = format!("css-{tag_name}");
        let head = self.document.head();
        if self.document.element_by_id_within(head, &css_id).is_some() {
            self.document
                .trace_style_line(format!("[style] skip tag={tag_name} id={css_id}"));
            return Ok(());
        }
        let link = self.document.create_element("link");
        self.document.set_attribute(link, "id", &css_id)?;
        self.document.set_attribute(link, "rel", "stylesheet")?;
        self.document.set_attribute(link, "href", style_url)?;
        let first = self.document.first_child(head);
        self.document.insert_before(head, link, first)?;
        self.document.trace_style_line(format!(
            "[style] inject tag={tag_name} id={css_id} kind=link"
        ));
        Ok(())
    }

    pub fn next_tick(&self, callback: Option<Box<dyn FnOnce()>>) {
        let node = self.document.create_text_node("");
        let mut pending = callback;
        self.document.observe_character_data(node, move |_record| {
            if let Some(callback) = pending.take() {
                callback();
            }
        });
        // Freshly created text node; the data write cannot fail.
        let _ = self.document.set_character_data(node, "1");
    }
}

fn to_camel_case(name: &str) -> String {
    let mut out = String::new();
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn css_property_name(prop: &str) -> String {
    let mut out = String::new();
    for ch in prop.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn parse_style_declarations(style_attr: Option<&str>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Some(style_attr) = style_attr else {
        return out;
    };

    for decl in style_attr.split(';') {
        let decl = decl.trim();
        if decl.is_empty() {
            continue;
        }
        let Some((name, value)) = decl.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let value = value.trim().to_string();
        if let Some(pos) = out.iter().position(|(existing, _)| existing == &name) {
            out[pos].1 = value;
        } else {
            out.push((name, value));
        }
    }

    out
}

fn serialize_style_declarations(decls: &[(String, String)]) -> String {
    let mut out = String::new();
    for (idx, (name, value)) in decls.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push(';');
    }
    out
}

fn format_float(value: f64) -> String {
    let mut out = format!("{:.16}", value);
    while out.contains('.') && out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}
