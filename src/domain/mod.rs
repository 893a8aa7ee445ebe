// Domain layer: data model and ports. Concrete collaborators live under adapters/.

pub mod model;
pub mod ports;
