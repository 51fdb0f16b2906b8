pub mod helpers;
pub mod indexer;
pub mod migration;
pub mod sync;
pub mod worker;
