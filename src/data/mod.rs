pub mod rock;

pub use rock::{get_rock_dataset, RockData, RockDataset, RockSample, Split};
