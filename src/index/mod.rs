pub mod cursor;

pub use cursor::{Cursor, CursorPos, CursorRegistry};
