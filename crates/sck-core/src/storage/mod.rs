pub mod card;
pub mod debug_log;
pub mod readings;
pub mod sd_card;

pub use card::{CardFs, CardPublisher, EnabledSet, StorageError};
pub use debug_log::{CARD_LOG, CardLog};
pub use readings::{PublishFlag, Reading, ReadingStore, StoreError};
pub use sd_card::SdCardFs;
