mod bitmap;
mod error;
mod id;
mod proto;

pub use bitmap::SlotBitmap;
pub use error::{err, Error, Result};
pub use id::{Id, ID_LEN};
pub use proto::{ObjectType, RefineKind, Role, Voice};
