use bitcoin::consensus::encode;
use thiserror::Error;
use utxord_btc_types::ContractError;

#[derive(Debug, Error)]
pub enum Bip322Error {
    #[error("address type is not supported for message signing: {0}")]
    UnsupportedAddress(String),

    #[error("signature is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("signature is not a serialized witness: {0}")]
    Witness(#[from] encode::Error),

    #[error(transparent)]
    Contract(#[from] ContractError),
}
