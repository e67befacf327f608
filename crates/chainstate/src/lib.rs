//! Chain state: UTXO set, header index, block validation and the engine that
//! ties them to storage.

pub mod genesis;
pub mod index;
pub mod notify;
pub mod orphans;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;

pub use genesis::build_genesis_block;
pub use index::{ChainTip, HeaderEntry};
pub use notify::{ListenerId, TipSnapshot};
pub use state::{
    BlockAcceptance, ChainState, ChainStateError, ChainStateOptions, RejectKind, Rejection,
    TemplateContext,
};
pub use undo::{SpentOutput, UndoRecord};
pub use utxo::{UtxoEntry, UtxoError, UtxoSet};
pub use validation::{prevalidate_block, PrevalidatedBlock, ValidationError};
