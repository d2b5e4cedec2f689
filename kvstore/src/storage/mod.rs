mod slot;
mod table;

pub use slot::ParameterSlot;
pub use table::SlotTable;
