//! Arena-backed conversation tree.
//!
//! Nodes live in a single `Vec` owned by [`Tree`]; parent and child links are
//! [`NodeId`] indices, never references. Nodes are only ever appended, so an
//! id stays valid for the lifetime of its tree.

use serde::Serialize;

use crate::core::types::{Message, NodeType};

/// Index of a node inside its [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One turn of the conversation, with the environment snapshot it produced.
#[derive(Debug, Clone)]
pub struct TreeNode<E> {
    pub node_type: NodeType,
    /// Thought text, function name, JSON arguments, or raw scriptlet.
    pub description: String,
    /// Conversation from the root up to and including this node's turn.
    pub messages: Vec<Message>,
    pub observation: String,
    pub observation_code: Option<i32>,
    /// Snapshot owned by this node; never shared with another node.
    pub io_state: E,
    pub is_terminal: bool,
    pub pruned: bool,
    father: Option<NodeId>,
    children: Vec<NodeId>,
    depth: usize,
}

impl<E> TreeNode<E> {
    pub fn father(&self) -> Option<NodeId> {
        self.father
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Terminal or pruned: the node must not be extended.
    pub fn is_closed(&self) -> bool {
        self.is_terminal || self.pruned
    }
}

#[derive(Debug, Clone)]
pub struct Tree<E> {
    nodes: Vec<TreeNode<E>>,
}

impl<E> Tree<E> {
    /// Create a tree holding only a root at depth 0.
    pub fn new(root_type: NodeType, io_state: E, messages: Vec<Message>) -> Self {
        Self {
            nodes: vec![TreeNode {
                node_type: root_type,
                description: String::new(),
                messages,
                observation: String::new(),
                observation_code: None,
                io_state,
                is_terminal: false,
                pruned: false,
                father: None,
                children: Vec::new(),
                depth: 0,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by id. Ids are only minted by this tree, so lookups cannot miss.
    pub fn node(&self, id: NodeId) -> &TreeNode<E> {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode<E> {
        &mut self.nodes[id.0]
    }

    /// Append a child under `father`.
    ///
    /// The child starts from a copy of the father's messages and owns
    /// `io_state`, which callers obtain by cloning the father's snapshot.
    pub fn add_child(
        &mut self,
        father: NodeId,
        node_type: NodeType,
        description: impl Into<String>,
        io_state: E,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let parent = &self.nodes[father.0];
        let node = TreeNode {
            node_type,
            description: description.into(),
            messages: parent.messages.clone(),
            observation: String::new(),
            observation_code: None,
            io_state,
            is_terminal: false,
            pruned: false,
            father: Some(father),
            children: Vec::new(),
            depth: parent.depth + 1,
        };
        self.nodes.push(node);
        self.nodes[father.0].children.push(id);
        id
    }

    /// Ids from the root down to `id`, inclusive.
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(father) = self.node(current).father {
            path.push(father);
            current = father;
        }
        path.reverse();
        path
    }

    /// Check structural invariants; returns one message per violation.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            let id = NodeId(idx);
            match node.father {
                None if idx != 0 => errors.push(format!("node {idx}: missing father")),
                None => {
                    if node.depth != 0 {
                        errors.push(format!("root: depth {} must be 0", node.depth));
                    }
                }
                Some(father) => {
                    let parent = &self.nodes[father.0];
                    if node.depth != parent.depth + 1 {
                        errors.push(format!(
                            "node {idx}: depth {} but father depth {}",
                            node.depth, parent.depth
                        ));
                    }
                    let listed = parent.children.iter().filter(|c| **c == id).count();
                    if listed != 1 {
                        errors.push(format!(
                            "node {idx}: listed {listed} times among father's children"
                        ));
                    }
                    if !node.messages.starts_with(&parent.messages) {
                        errors.push(format!(
                            "node {idx}: messages do not extend father's messages"
                        ));
                    }
                }
            }
            if node.pruned && !node.children.is_empty() {
                errors.push(format!("node {idx}: pruned node has children"));
            }
            if self.path_to(id).len() != node.depth + 1 {
                errors.push(format!("node {idx}: root not reached in depth hops"));
            }
        }
        errors
    }
}
