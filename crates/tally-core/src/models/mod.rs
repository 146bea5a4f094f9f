pub mod audit;
pub mod fingerprint;
pub mod inventory;
pub mod ocr;
pub mod quality;
pub mod quarantine;
pub mod session;
pub mod upload;

pub use audit::*;
pub use fingerprint::*;
pub use inventory::*;
pub use ocr::*;
pub use quality::*;
pub use quarantine::*;
pub use session::*;
pub use upload::*;
