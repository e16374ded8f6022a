//! History resolution: anchor selection, ancestor walks, windowing, and
//! branch navigation over the message tree.

pub mod branches;
pub mod cursor;
pub mod resolver;

pub use branches::BranchNavigator;
pub use cursor::PageCursor;
pub use resolver::{HistoryResolver, Window, WindowQuery};
