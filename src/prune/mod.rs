pub mod heading;
pub mod table;
