//! Header chain: validated append, reorganization, locators, persistence.

mod header_chain;
mod work;

pub use header_chain::HeaderChain;
pub use work::ChainWork;
