pub mod reader;
pub mod set;
pub mod table;

pub use reader::{read_log, ExperimentRecord};
pub use set::{
    Changes, CodeChange, CommitGroup, ExperimentSet, LoadOptions, SkippedExperiment,
};
pub use table::{
    commit_group_table, experiments_table, experiments_table_with_columns, flatten,
    format_timestamp, informative_columns,
};
