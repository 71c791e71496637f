pub mod comparator;
pub mod engine;
pub mod executor;
pub mod path_map;
pub mod plan;
pub mod scanner;
pub mod tree;

pub use comparator::{DiffEngine, FileRelation};
pub use engine::{SyncContext, SyncEngine};
pub use executor::{
    format_size, Direction, ItemAction, ItemOutcome, ItemReport, Phase, Pipeline, PlanExecutor,
    SyncStats,
};
pub use path_map::PathMapper;
pub use plan::{Conflict, PlanSummary, PlannedFile, PlannedFolder, SyncPlan, TypeConflict};
pub use scanner::{ExclusionFilter, LocalScanner, RemoteScanner};
pub use tree::{ContentHash, FileNode, FolderNode, HashAlgorithm, Node, NodeKind, Tree};
