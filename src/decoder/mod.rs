

mod dec;
mod table;

pub use dec::{DecodeIo, Decoder};
pub use table::{HeaderTable, TableEntry};
