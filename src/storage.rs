//! [`PersistentStore`](crate::traits::PersistentStore) backends.

pub mod file;
pub mod memory;

#[doc(inline)]
pub use file::FileStore;
#[doc(inline)]
pub use memory::MokaStore;

use crate::error::Error;
use crate::traits::PersistentStore;

/// The tier to use when persistence is unavailable: reads miss and writes go nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl PersistentStore for NullStore {
    fn name(&self) -> &'static str {
        "null"
    }

    fn get_item(&self, _key: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), Error> {
        Ok(())
    }

    fn remove_item(&self, _key: &str) -> Result<(), Error> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}
