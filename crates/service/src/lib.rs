pub mod service;

pub use service::{
    cancel_sweep, close_sweep, delete_all_entries, delete_entry, get_sweep_session, list_profiles,
    poll_sweep_events, session_entries, start_sweep, CancelSweepResponse, DeleteEntryResult,
    SweepEvent, SweepPhase, SweepRequest, SweepSessionSnapshot, SweepSessionStatus,
};
