pub mod coerce;
pub mod events;
pub mod history;
pub mod intent;
pub mod research;
pub mod scan;
pub mod ui;
pub mod vision;
