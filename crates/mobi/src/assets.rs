//! Templates and stylesheet embedded into the binary at compile time using
//! [`rust-embed`](rust_embed).

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "assets/"]
pub(crate) struct Assets;
impl Assets {
    pub(crate) fn load(name: &str) -> Result<Vec<u8>> {
        Self::get(name).map(|f| f.data.into_owned()).ok_or_raise(|| ErrorKind::AssetNotFound(name.to_string()))
    }

    pub(crate) fn load_str(name: &str) -> Result<String> {
        String::from_utf8(Self::load(name)?).or_raise(|| ErrorKind::AssetNotFound(name.to_string()))
    }
}
