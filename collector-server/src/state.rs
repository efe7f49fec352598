use std::sync::Arc;

use pipeline::Pipeline;

/// Shared state handed to every handler via `web::Data` (spec §10.5):
/// a single `Arc<Pipeline>` handle, mirroring the teacher's
/// `ServerState` being the one object every `syncserver` handler closes
/// over.
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
}
