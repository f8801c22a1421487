//! # Hierarchy Model
//!
//! The DTOs every layer shares: node identities, nodes, and the closure
//! relationships between them. Pure data, no I/O, no async.

pub mod node;
pub mod relationship;
pub mod navigation;

pub use node::{HierarchyNode, NodeId, NodeKey, NodeRecord, SequentialKey, TreeNode};
pub use relationship::{ClosureRelationship, EdgePayload};
pub use navigation::Navigation;
