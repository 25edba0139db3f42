pub mod command;
pub mod control;
pub mod page;
pub mod session;

pub use command::{Command, CommandKind, ParseError};
pub use control::{Control, ROOT_CONTROL_ID};
pub use page::{Page, PageName, PageNameError};
pub use session::{full_session_id, parse_full_session_id, Session, ZERO_SESSION};
