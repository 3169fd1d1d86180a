mod clients;
mod evm;
mod retry;
mod tendermint;

pub use clients::*;
pub use evm::*;
pub use retry::*;
pub use tendermint::*;
