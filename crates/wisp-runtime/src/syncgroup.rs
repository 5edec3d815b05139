//! Sync-groups: atomic sampling receive across several channels at
//! once (spec.md §4.5). A routine blocked on a sync-group wakes as
//! soon as any member channel has a value; the receive then drains
//! *every* member that currently has data in one atomic sample and
//! hands back one slot per member (`nil` for the ones that didn't).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::object::ObjRef;
use crate::value::Value;

/// The state behind a `SyncGroup` heap object.
pub struct SyncGroupInner {
    pub channels: Vec<ObjRef>,
}

impl SyncGroupInner {
    pub fn new(channels: Vec<ObjRef>) -> Self {
        SyncGroupInner { channels }
    }
}

/// Polling interval used while sampling member channels; short enough
/// that a sync-group receive observes a newly sent value within a
/// couple milliseconds without spinning a dedicated OS thread per
/// member channel.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Samples every channel in `members` in one pass, non-blockingly
/// draining whichever ones currently have a value, and repeats until
/// at least one of them yielded something (or `timeout` elapses). The
/// result has one slot per member: `Some(value)` for a channel that
/// produced data on the winning sample, `None` for one that didn't.
pub fn receive_group(members: &[Arc<Channel>], timeout: Option<Duration>) -> Option<Vec<Option<Value>>> {
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        let sample: Vec<Option<Value>> = members.iter().map(|ch| ch.try_pop()).collect();
        if sample.iter().any(Option::is_some) {
            return Some(sample);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return None;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_from_whichever_channels_have_data() {
        let a = Arc::new(Channel::new(1));
        let b = Arc::new(Channel::new(1));
        b.send(Value::Int32(42)).unwrap();
        let sample = receive_group(&[a, b], Some(Duration::from_millis(50))).unwrap();
        assert_eq!(sample, vec![None, Some(Value::Int32(42))]);
    }

    #[test]
    fn collects_from_every_ready_channel_in_one_sample() {
        let a = Arc::new(Channel::new(1));
        let b = Arc::new(Channel::new(1));
        a.send(Value::Int32(1)).unwrap();
        b.send(Value::Int32(2)).unwrap();
        let sample = receive_group(&[a, b], Some(Duration::from_millis(50))).unwrap();
        assert_eq!(sample, vec![Some(Value::Int32(1)), Some(Value::Int32(2))]);
    }

    #[test]
    fn times_out_when_nothing_arrives() {
        let a = Arc::new(Channel::new(1));
        let result = receive_group(&[a], Some(Duration::from_millis(10)));
        assert!(result.is_none());
    }
}
