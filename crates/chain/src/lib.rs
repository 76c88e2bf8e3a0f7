//! Header chain storage and consensus tracking.
//!
//! Headers live in flat files of fixed-size records. The main chain
//! file holds the most-work branch; competing branches each get a fork
//! file under `forks/` and are promoted by swapping file contents when
//! they overtake their parent.

pub mod chain;
pub mod headerfile;
pub mod manager;

pub use chain::{fork_file_name, parse_fork_file_name, ChainEntry, FORKS_DIR_NAME, MAIN_FILE_NAME};
pub use headerfile::{HeaderFile, RECORD_SIZE};
pub use manager::{ChainError, ChainManager};
