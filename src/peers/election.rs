//! Which side of a peer pair opens the link.
//!
//! Both sides run the same comparison on the same inputs, so exactly one of
//! them initiates without any coordination.

use std::cmp::Ordering;

/// The inputs to the election for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub uuid: &'a str,
    pub priority: i64,
    pub start_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We open the WebSocket.
    Initiate,
    /// The peer connects to us.
    Wait,
}

/// Decide our role towards `remote`.
///
/// Higher priority initiates. On equal priority the later starter initiates,
/// and on equal start times the greater uuid does.
pub fn negotiate(local: Candidate<'_>, remote: Candidate<'_>) -> LinkRole {
    let order = local
        .priority
        .cmp(&remote.priority)
        .then(local.start_time.cmp(&remote.start_time))
        .then_with(|| local.uuid.cmp(remote.uuid));
    match order {
        Ordering::Greater => LinkRole::Initiate,
        _ => LinkRole::Wait,
    }
}
