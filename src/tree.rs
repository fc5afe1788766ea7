use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// One message in a conversation. Parent-pointer tree rather than a list
/// because conversations branch: regenerate, fork, edit-and-resend all
/// create siblings. Node identity is stable for the whole life of a stream,
/// so repeated repaints of the same node are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNode {
    pub id: Uuid,
    pub role: Role,
    pub content: MessageContent,
    pub parent_id: Option<Uuid>,
    pub children: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
    /// Reasoning trace, kept apart from the visible answer.
    #[serde(default)]
    pub thoughts_raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<Value>,
    /// Which credential produced this node, for regeneration and display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_model_id: Option<String>,
}

impl MessageNode {
    fn new(role: Role, content: MessageContent, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            parent_id,
            children: Vec::new(),
            timestamp: Utc::now(),
            thoughts_raw: String::new(),
            grounding_metadata: None,
            api_uuid: None,
            api_model_id: None,
        }
    }
}

/// What happens to the remaining children when a multi-child root is
/// deleted. Promoting mirrors the observed behavior of branching UIs;
/// discarding keeps the forest to a single tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// First child becomes the root; the rest detach as independent roots.
    #[default]
    PromoteSiblings,
    /// First child becomes the root; the rest are removed with their subtrees.
    Discard,
}

/// Conversation storage. Alongside the tree itself an insertion-order list
/// is maintained so rendering can walk `order` without recomputing the
/// tree, and inserts keep that list consistent with the structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTree {
    nodes: HashMap<Uuid, MessageNode>,
    order: Vec<Uuid>,
    roots: Vec<Uuid>,
    pub current_node: Option<Uuid>,
    #[serde(skip, default)]
    orphan_policy: OrphanPolicy,
}

impl Default for ConversationTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::with_policy(OrphanPolicy::default())
    }

    pub fn with_policy(orphan_policy: OrphanPolicy) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            roots: Vec::new(),
            current_node: None,
            orphan_policy,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: Uuid) -> Option<&MessageNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: Uuid) -> Option<&mut MessageNode> {
        self.nodes.get_mut(&id)
    }

    pub fn roots(&self) -> &[Uuid] {
        &self.roots
    }

    /// Ids in rendering order.
    pub fn order(&self) -> &[Uuid] {
        &self.order
    }

    /// Inserts a node. With `after: None` the node becomes a root. When
    /// `next_id` names a current direct child of `after`, that child is
    /// rewired under the new node, so A -> B becomes A -> new -> B and the
    /// render order reads [A, new, B].
    pub fn insert_after(
        &mut self,
        after: Option<Uuid>,
        role: Role,
        content: MessageContent,
        next_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let mut node = MessageNode::new(role, content, after);
        let new_id = node.id;

        match after {
            None => {
                self.nodes.insert(new_id, node);
                self.roots.push(new_id);
                self.order.push(new_id);
            }
            Some(after_id) => {
                if !self.nodes.contains_key(&after_id) {
                    return Err(AqueductError::Config(format!(
                        "insert_after: unknown parent node {}",
                        after_id
                    ))
                    .into());
                }
                let rewired = next_id.filter(|n| {
                    self.nodes
                        .get(&after_id)
                        .map(|p| p.children.contains(n))
                        .unwrap_or(false)
                });

                if let Some(next) = rewired {
                    node.children.push(next);
                    self.nodes.insert(new_id, node);
                    if let Some(parent) = self.nodes.get_mut(&after_id) {
                        // The new node takes next's slot among the parent's
                        // children.
                        match parent.children.iter().position(|c| *c == next) {
                            Some(pos) => parent.children[pos] = new_id,
                            None => parent.children.push(new_id),
                        }
                    }
                    if let Some(next_node) = self.nodes.get_mut(&next) {
                        next_node.parent_id = Some(new_id);
                    }
                    let pos = self
                        .order
                        .iter()
                        .position(|id| *id == next)
                        .unwrap_or(self.order.len());
                    self.order.insert(pos, new_id);
                } else {
                    self.nodes.insert(new_id, node);
                    if let Some(parent) = self.nodes.get_mut(&after_id) {
                        parent.children.push(new_id);
                    }
                    let pos = self
                        .order
                        .iter()
                        .position(|id| *id == after_id)
                        .map(|p| p + 1)
                        .unwrap_or(self.order.len());
                    self.order.insert(pos, new_id);
                }
            }
        }
        Ok(new_id)
    }

    /// Removes a node. A non-root node's children are re-parented onto its
    /// parent, taking the deleted node's slot in order. A root with
    /// multiple children follows the configured orphan policy.
    pub fn delete_node(&mut self, id: Uuid) -> Result<()> {
        let Some(node) = self.nodes.remove(&id) else {
            return Err(AqueductError::Config(format!("delete_node: unknown node {}", id)).into());
        };
        self.order.retain(|n| *n != id);

        match node.parent_id {
            Some(parent_id) => {
                for child in &node.children {
                    if let Some(child_node) = self.nodes.get_mut(child) {
                        child_node.parent_id = Some(parent_id);
                    }
                }
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    match parent.children.iter().position(|c| *c == id) {
                        Some(pos) => {
                            parent.children.splice(pos..=pos, node.children.iter().copied());
                        }
                        None => parent.children.extend(node.children.iter().copied()),
                    }
                }
            }
            None => {
                self.roots.retain(|r| *r != id);
                let mut children = node.children.iter().copied();
                if let Some(first) = children.next() {
                    if let Some(first_node) = self.nodes.get_mut(&first) {
                        first_node.parent_id = None;
                    }
                    self.roots.push(first);
                    match self.orphan_policy {
                        OrphanPolicy::PromoteSiblings => {
                            for sibling in children {
                                if let Some(n) = self.nodes.get_mut(&sibling) {
                                    n.parent_id = None;
                                }
                                self.roots.push(sibling);
                            }
                        }
                        OrphanPolicy::Discard => {
                            let orphans: Vec<Uuid> = children.collect();
                            for orphan in orphans {
                                self.remove_subtree(orphan);
                            }
                        }
                    }
                }
            }
        }

        if self.current_node == Some(id) {
            self.current_node = node.parent_id.or_else(|| self.roots.first().copied());
        }
        if let Some(current) = self.current_node {
            if !self.nodes.contains_key(&current) {
                self.current_node = self.roots.first().copied();
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, id: Uuid) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        self.order.retain(|n| *n != id);
        for child in node.children {
            self.remove_subtree(child);
        }
    }

    /// Root-to-node path as chat messages, the linearization a request is
    /// built from.
    pub fn path_to(&self, id: Uuid) -> Vec<ChatMessage> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            let Some(node) = self.nodes.get(&node_id) else {
                break;
            };
            path.push(ChatMessage {
                role: node.role,
                content: node.content.clone(),
            });
            cursor = node.parent_id;
        }
        path.reverse();
        path
    }

    /// Structural consistency: every parent/child edge must be mutual, every
    /// root parentless, the order list a permutation of the node set, and
    /// `current_node` valid when set.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> {
            Err(AqueductError::Internal(msg, tracing_error::SpanTrace::capture()).into())
        };

        if self.order.len() != self.nodes.len() {
            return fail("order list and node set diverge".into());
        }
        for id in &self.order {
            if !self.nodes.contains_key(id) {
                return fail(format!("order references missing node {}", id));
            }
        }
        for (id, node) in &self.nodes {
            match node.parent_id {
                Some(parent_id) => {
                    let Some(parent) = self.nodes.get(&parent_id) else {
                        return fail(format!("node {} has dangling parent {}", id, parent_id));
                    };
                    if !parent.children.contains(id) {
                        return fail(format!("parent {} does not list child {}", parent_id, id));
                    }
                }
                None => {
                    if !self.roots.contains(id) {
                        return fail(format!("parentless node {} missing from roots", id));
                    }
                }
            }
            for child in &node.children {
                match self.nodes.get(child) {
                    Some(c) if c.parent_id == Some(*id) => {}
                    _ => return fail(format!("child edge {} -> {} not mutual", id, child)),
                }
            }
        }
        if let Some(current) = self.current_node {
            if !self.nodes.contains_key(&current) {
                return fail(format!("current_node {} does not exist", current));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> MessageContent {
        MessageContent::Text(s.to_string())
    }

    #[test]
    fn insert_after_appends_and_orders() {
        let mut tree = ConversationTree::new();
        let a = tree.insert_after(None, Role::User, text("a"), None).unwrap();
        let b = tree.insert_after(Some(a), Role::Assistant, text("b"), None).unwrap();
        assert_eq!(tree.order(), &[a, b]);
        assert_eq!(tree.node(a).unwrap().children, vec![b]);
        assert_eq!(tree.node(b).unwrap().parent_id, Some(a));
        tree.validate().unwrap();
    }

    #[test]
    fn insert_with_next_id_rewires_between() {
        let mut tree = ConversationTree::new();
        let a = tree.insert_after(None, Role::User, text("a"), None).unwrap();
        let b = tree.insert_after(Some(a), Role::Assistant, text("b"), None).unwrap();

        let new = tree
            .insert_after(Some(a), Role::User, text("edited"), Some(b))
            .unwrap();

        assert_eq!(tree.order(), &[a, new, b]);
        assert_eq!(tree.node(a).unwrap().children, vec![new]);
        assert_eq!(tree.node(new).unwrap().children, vec![b]);
        assert_eq!(tree.node(b).unwrap().parent_id, Some(new));
        tree.validate().unwrap();
    }

    #[test]
    fn stale_next_id_falls_back_to_append() {
        let mut tree = ConversationTree::new();
        let a = tree.insert_after(None, Role::User, text("a"), None).unwrap();
        let unrelated = Uuid::new_v4();
        let new = tree
            .insert_after(Some(a), Role::Assistant, text("b"), Some(unrelated))
            .unwrap();
        assert_eq!(tree.node(a).unwrap().children, vec![new]);
        assert!(tree.node(new).unwrap().children.is_empty());
        tree.validate().unwrap();
    }

    #[test]
    fn delete_reparents_children_in_place() {
        let mut tree = ConversationTree::new();
        let a = tree.insert_after(None, Role::User, text("a"), None).unwrap();
        let b = tree.insert_after(Some(a), Role::Assistant, text("b"), None).unwrap();
        let c = tree.insert_after(Some(b), Role::User, text("c"), None).unwrap();

        tree.delete_node(b).unwrap();
        assert_eq!(tree.node(a).unwrap().children, vec![c]);
        assert_eq!(tree.node(c).unwrap().parent_id, Some(a));
        assert_eq!(tree.order(), &[a, c]);
        tree.validate().unwrap();
    }

    #[test]
    fn root_deletion_promotes_siblings_by_default() {
        let mut tree = ConversationTree::new();
        let root = tree.insert_after(None, Role::User, text("root"), None).unwrap();
        let x = tree.insert_after(Some(root), Role::Assistant, text("x"), None).unwrap();
        let y = tree.insert_after(Some(root), Role::Assistant, text("y"), None).unwrap();

        tree.delete_node(root).unwrap();
        assert_eq!(tree.roots(), &[x, y]);
        assert_eq!(tree.node(y).unwrap().parent_id, None);
        tree.validate().unwrap();
    }

    #[test]
    fn root_deletion_can_discard_orphans() {
        let mut tree = ConversationTree::with_policy(OrphanPolicy::Discard);
        let root = tree.insert_after(None, Role::User, text("root"), None).unwrap();
        let x = tree.insert_after(Some(root), Role::Assistant, text("x"), None).unwrap();
        let y = tree.insert_after(Some(root), Role::Assistant, text("y"), None).unwrap();
        let y_child = tree.insert_after(Some(y), Role::User, text("yc"), None).unwrap();

        tree.delete_node(root).unwrap();
        assert_eq!(tree.roots(), &[x]);
        assert!(tree.node(y).is_none());
        assert!(tree.node(y_child).is_none());
        tree.validate().unwrap();
    }

    #[test]
    fn path_linearizes_root_to_node() {
        let mut tree = ConversationTree::new();
        let a = tree.insert_after(None, Role::System, text("sys"), None).unwrap();
        let b = tree.insert_after(Some(a), Role::User, text("q"), None).unwrap();
        let c = tree.insert_after(Some(b), Role::Assistant, text("ans"), None).unwrap();

        let path = tree.path_to(c);
        assert_eq!(path.len(), 3);
        assert_eq!(path[0].role, Role::System);
        assert_eq!(path[2].content.to_text(), "ans");
    }

    #[test]
    fn current_node_stays_valid_after_delete() {
        let mut tree = ConversationTree::new();
        let a = tree.insert_after(None, Role::User, text("a"), None).unwrap();
        let b = tree.insert_after(Some(a), Role::Assistant, text("b"), None).unwrap();
        tree.current_node = Some(b);
        tree.delete_node(b).unwrap();
        assert_eq!(tree.current_node, Some(a));
        tree.validate().unwrap();
    }
}
