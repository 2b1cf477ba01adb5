//! Timer-driven supervision.
//!
//! A periodic tick (nominally one second) drives everything the protocol
//! requires to happen without inbound traffic: logon generation and retry
//! backoff for initiators, heartbeat emission, test-request escalation when
//! the peer goes quiet, and the logon/logout/dead-peer timeouts.

use crate::fix::session::Session;
use crate::fix::state::SessionState;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

impl Session {
    /// Timer tick entry point.
    pub fn next(&self) {
        self.next_at(Instant::now(), Utc::now());
    }

    pub(crate) fn next_at(&self, now: Instant, wall: DateTime<Utc>) {
        // A locally requested logout goes out first; the tick then falls
        // through so its timeout is supervised below.
        {
            let state = self.lock_state();
            if !state.enabled {
                if !state.is_logged_on() {
                    return;
                }
                if !state.logout_sent {
                    drop(state);
                    info!(session_id = %self.session_id(), "initiating logout");
                    self.send_logout(None);
                }
            }
        }

        let creation_time = self.lock_state().creation_time();
        if !self.settings.schedule.is_session_time(wall)
            || !self
                .settings
                .schedule
                .is_same_session(wall, creation_time)
        {
            info!(session_id = %self.session_id(), "outside of session window, resetting");
            self.reset();
            return;
        }

        if !self.has_responder() {
            return;
        }

        {
            let state = self.lock_state();
            if !state.logon_received {
                if state.should_send_logon() {
                    if self.is_time_to_generate_logon(&state, now) {
                        drop(state);
                        if self.application.can_logon(self.session_id()) {
                            {
                                let mut state = self.lock_state();
                                state.logon_attempts += 1;
                                state.last_logon_attempt = Some(now);
                            }
                            self.generate_logon();
                        } else {
                            debug!(session_id = %self.session_id(), "application deferred logon");
                        }
                    }
                } else if state.logon_timed_out(now) {
                    drop(state);
                    error!(session_id = %self.session_id(), "timed out waiting for logon response");
                    self.disconnect();
                }
                return;
            }
        }

        if self.lock_state().heart_bt_int == 0 {
            return;
        }

        if self.lock_state().logout_timed_out(now) {
            error!(session_id = %self.session_id(), "timed out waiting for logout response");
            self.disconnect();
            return;
        }

        if self.lock_state().within_heartbeat(now) {
            return;
        }

        if self.lock_state().timed_out(now) {
            if self.settings.disable_heart_beat_check {
                warn!(
                    session_id = %self.session_id(),
                    "no inbound traffic past the heartbeat deadline, but heartbeat checking is disabled"
                );
            } else {
                error!(session_id = %self.session_id(), "peer heartbeat timed out, disconnecting");
                self.disconnect();
            }
            return;
        }

        let escalate = {
            let mut state = self.lock_state();
            if state.test_request_needed(now) {
                state.test_request_counter += 1;
                true
            } else {
                false
            }
        };
        if escalate {
            info!(session_id = %self.session_id(), "peer is quiet, sending test request");
            self.send_test_request("TEST");
            return;
        }

        if self.lock_state().heartbeat_needed(now) {
            self.send_heartbeat(None);
        }
    }

    fn is_time_to_generate_logon(&self, state: &SessionState, now: Instant) -> bool {
        match state.last_logon_attempt {
            None => true,
            Some(last) => {
                now.duration_since(last) >= self.next_logon_delay(state.logon_attempts)
            }
        }
    }

    /// Retry backoff: the configured table of seconds, indexed by attempt
    /// count and clamped to its last entry.
    fn next_logon_delay(&self, attempts: u32) -> Duration {
        let intervals = &self.settings.logon_intervals;
        let index = (attempts.saturating_sub(1) as usize).min(intervals.len() - 1);
        Duration::from_secs(intervals[index])
    }
}
