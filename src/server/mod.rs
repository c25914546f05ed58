pub mod guards;
pub mod router;
pub mod routes;

pub use router::{CastorState, castor_router};
