/// Associates readiness events with the device that produced them.
///
/// A `Token` is the slot of a device in the loop's device table. It is
/// passed to the selector on registration and comes back attached to every
/// readiness event, letting the loop route the event without a lookup by
/// file descriptor.
///
/// `Token(usize::MAX)` is reserved for internal use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
