pub mod issue;
pub mod report;

pub use issue::*;
pub use report::*;
