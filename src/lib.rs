//! # closure-table: Closure-Table Hierarchies in Rust
//!
//! Keeps a flat, fully materialized ancestor/descendant relation in sync with
//! a single-parent tree, so "all ancestors of X" and "all descendants of X"
//! are a single indexed lookup instead of a recursive walk.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `ClosureStore` is the contract between the closure maintainer and storage
//! 2. **Clean DTOs**: `NodeRecord`, `ClosureRelationship` cross all boundaries
//! 3. **One mutation, one transaction**: a re-parenting cascade commits or leaves nothing behind
//! 4. **Explicit loading**: navigations that were not loaded fail instead of reading as empty
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use closure_table::{Hierarchy, NodeId};
//!
//! # async fn example() -> closure_table::Result<()> {
//! let hierarchy = Hierarchy::<closure_table::MemoryStore<NodeId>>::open_memory().await?;
//!
//! let root = hierarchy.create(None, ()).await?;
//! let child = hierarchy.create(Some(root), ()).await?;
//! let grandchild = hierarchy.create(Some(child), ()).await?;
//!
//! assert_eq!(hierarchy.ancestors_count(&grandchild).await?, 2);
//! assert!(hierarchy.has_descendants(&root).await?);
//!
//! // Move the grandchild up; its closure rows are rebuilt in one transaction.
//! hierarchy.set_parent(&grandchild, Some(root)).await?;
//! assert_eq!(hierarchy.ancestors_count(&grandchild).await?, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Stores
//!
//! | Store | Description |
//! |-------|-------------|
//! | `MemoryStore` | Snapshot-isolated in-memory store for testing/embedding |
//! | `Forest` | Synchronous, single-owner closure maintainer with no store |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod query;
pub mod closure;
pub mod storage;
pub mod tx;
pub mod config;
pub mod hierarchy;
pub mod export;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    ClosureRelationship, EdgePayload, HierarchyNode, Navigation,
    NodeId, NodeKey, NodeRecord, SequentialKey, TreeNode,
};

// ============================================================================
// Re-exports: Closure maintenance
// ============================================================================

pub use closure::{CascadeStats, Forest};
pub use hierarchy::{ExplicitTx, Hierarchy, Include};
pub use query::RelationshipFilter;

// ============================================================================
// Re-exports: Storage
// ============================================================================

pub use storage::{BackendConfig, ClosureStore, MemoryStore, MemoryTx};
pub use config::HierarchyConfig;

// ============================================================================
// Re-exports: Transactions
// ============================================================================

pub use tx::{Transaction, TxId, TxMode};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Node {id} cannot be its own parent")]
    SelfParent { id: String },

    #[error("Cannot move node {id} under {parent}: {parent} is its descendant")]
    Cycle { id: String, parent: String },

    #[error("Moving node {id} would reach depth {depth}, limit is {max}")]
    DepthLimit { id: String, depth: u32, max: u32 },

    #[error("Navigation property '{0}' was not loaded")]
    NavigationNotLoaded(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Corrupt closure: {0}")]
    CorruptClosure(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
