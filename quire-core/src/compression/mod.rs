//! Text compression schemes of Palm-era ebook formats

pub mod huffcdic;
pub mod palmdoc;
pub mod tcr;

pub use huffcdic::HuffCdicReader;
