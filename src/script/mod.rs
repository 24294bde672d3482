//! Oracle scripts: parsing and patching, the interpreter pool and result
//! merging.

pub mod descriptor;
pub mod merge;
pub mod pool;

pub use descriptor::{LookupSite, OracleDescriptor, Resolution};
pub use merge::{default_merge, merge_results};
pub use pool::{InterpreterPool, PooledInterpreter};
