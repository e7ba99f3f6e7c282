pub mod dataset;
pub mod flow;
pub mod gpu;
pub mod layers;
pub mod linalg;
pub mod loss;
pub mod model;
pub mod optim;
pub mod persistence;
pub mod sampling;
pub mod training;
