use serde::{Deserialize, Serialize};


/// One row of a shard's antenna table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaInfo {
    pub id: u32,
    pub name: String,
    pub station: String,
    /// Dish diameter in metres.
    pub diameter: f64,
    /// ITRF position in metres.
    pub position: [f64; 3],
}

impl AntennaInfo {
    pub fn new(id: u32, name: &str, station: &str) -> AntennaInfo {
        AntennaInfo {
            id,
            name: name.to_string(),
            station: station.to_string(),
            diameter: 0.0,
            position: [0.0; 3],
        }
    }
}
