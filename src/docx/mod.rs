pub mod body;
pub mod media;
pub mod package;
pub mod placeholder;
pub mod settings;
pub mod styles;
pub mod table;
pub mod xml;
