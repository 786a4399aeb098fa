// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Priority for the output callback thread when MELODYQ_THREAD_PRIORITY is unset.
const DEFAULT_CALLBACK_THREAD_PRIORITY: u8 = 70;

/// Raises the priority of the thread that first calls [`CallbackPriority::apply`].
///
/// The environment is read when the stream is built so the callback never touches it.
pub struct CallbackPriority {
    priority: Option<ThreadPriorityValue>,
    #[cfg_attr(not(unix), allow(dead_code))]
    realtime: bool,
    applied: bool,
}

impl CallbackPriority {
    /// Reads MELODYQ_THREAD_PRIORITY (0-99) and MELODYQ_DISABLE_RT_AUDIO.
    pub fn from_env() -> CallbackPriority {
        let priority = std::env::var("MELODYQ_THREAD_PRIORITY")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .filter(|n| *n < 100)
            .unwrap_or(DEFAULT_CALLBACK_THREAD_PRIORITY);

        CallbackPriority {
            priority: ThreadPriorityValue::try_from(priority).ok(),
            realtime: !env_flag("MELODYQ_DISABLE_RT_AUDIO"),
            applied: false,
        }
    }

    /// Applies the priority to the current thread. Only the first call does anything.
    pub fn apply(&mut self) {
        if self.applied {
            return;
        }
        self.applied = true;

        let Some(priority) = self.priority else {
            return;
        };
        let tp = ThreadPriority::Crossplatform(priority);
        let _ = set_current_thread_priority(tp);

        #[cfg(unix)]
        if self.realtime {
            use thread_priority::unix::{
                set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
                ThreadSchedulePolicy,
            };
            match set_thread_priority_and_policy(
                thread_native_id(),
                tp,
                ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
            ) {
                Ok(()) => info!("Enabled RT SCHED_FIFO for output callback thread"),
                Err(e) => warn!(
                    error = %e,
                    "Failed to set RT SCHED_FIFO for output callback thread"
                ),
            }
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_only_runs_once() {
        let mut priority = CallbackPriority {
            priority: None,
            realtime: false,
            applied: false,
        };
        priority.apply();
        assert!(priority.applied);
        priority.apply();
        assert!(priority.applied);
    }
}
