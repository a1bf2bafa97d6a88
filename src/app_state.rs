// =============================================================================
// Application state — the handful of shared collaborators the REST and
// WebSocket surfaces need: the Controller singleton, the event fan-out, and
// the preferences repository. No subsystem here owns the hot path.
// =============================================================================

use std::sync::Arc;

use crate::controller::Controller;
use crate::events::EventSink;
use crate::persistence::PreferencesRepository;

pub struct AppState {
    pub controller: Arc<Controller>,
    pub events: EventSink,
    pub preferences: Arc<dyn PreferencesRepository>,
}

impl AppState {
    pub fn new(controller: Arc<Controller>, events: EventSink, preferences: Arc<dyn PreferencesRepository>) -> Self {
        Self { controller, events, preferences }
    }
}
