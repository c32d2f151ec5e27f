pub mod crawl_job;
pub mod crawl_result;
pub mod payload;
pub mod selection;

pub use crawl_job::*;
pub use crawl_result::*;
pub use payload::*;
pub use selection::JobSelection;
