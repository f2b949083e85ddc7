/// Server-assigned identity of one connected client. Allocated from a
/// monotone counter, so an id is never reused within a relay process.
pub type SessionId = u64;
