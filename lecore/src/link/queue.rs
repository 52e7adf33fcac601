//! Bounded queues for data channel PDUs.
//!
//! Every connection has one queue in each direction between the host and the link layer. The
//! radio side consumes from the TX queue while the connection event is being set up, and pushes
//! into the RX queue from the radio completion path; the host side runs from the application's
//! idle loop.
//!
//! Consumers look at the head of the queue through a closure and return a [`Consume`] value that
//! decides whether the PDU is removed. This lets the link layer leave a PDU queued when it can't
//! be sent yet (eg. it doesn't fit the negotiated data length).
//!
//! [`Consume`]: struct.Consume.html

use {
    super::data::DataPdu,
    crate::Error,
    heapless::Deque,
};

/// Number of PDUs buffered per connection and direction.
pub const QUEUE_DEPTH: usize = 4;

/// Bundles a `T` along with information telling a queue whether to consume a packet.
#[derive(Debug)]
pub struct Consume<T> {
    consume: bool,
    result: Result<T, Error>,
}

impl<T> Consume<T> {
    /// Consume the currently processed packet iff `consume` is `true`, then return `result`.
    pub fn new(consume: bool, result: Result<T, Error>) -> Self {
        Self { consume, result }
    }

    /// Consume the currently processed packet, then return `result`.
    pub fn always(result: Result<T, Error>) -> Self {
        Self {
            consume: true,
            result,
        }
    }

    /// Do not consume the currently processed packet, then return `result`.
    ///
    /// The next call to `consume_with` will yield the same packet again.
    pub fn never(result: Result<T, Error>) -> Self {
        Self {
            consume: false,
            result,
        }
    }

    /// Consume the currently processed packet if `result` indicates success, then return the
    /// result.
    pub fn on_success(result: Result<T, Error>) -> Self {
        Self {
            consume: result.is_ok(),
            result,
        }
    }
}

/// A FIFO of data channel PDUs.
pub struct PduQueue<const N: usize = QUEUE_DEPTH> {
    inner: Deque<DataPdu, N>,
}

impl<const N: usize> PduQueue<N> {
    /// Creates a new, empty queue.
    pub const fn new() -> Self {
        Self {
            inner: Deque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    /// Appends `pdu`, failing with `Error::Eof` when the queue is full.
    pub fn push(&mut self, pdu: DataPdu) -> Result<(), Error> {
        self.inner.push_back(pdu).map_err(|_| Error::Eof)
    }

    /// Removes and returns the oldest PDU.
    pub fn pop(&mut self) -> Option<DataPdu> {
        self.inner.pop_front()
    }

    /// Passes the oldest PDU to a closure, which decides whether it is removed.
    ///
    /// Returns `Error::Eof` if the queue is empty.
    pub fn consume_with<R>(&mut self, f: impl FnOnce(&DataPdu) -> Consume<R>) -> Result<R, Error> {
        let res = match self.inner.front() {
            Some(pdu) => f(pdu),
            None => return Err(Error::Eof),
        };
        if res.consume {
            self.inner.pop_front();
        }
        res.result
    }

    /// Drops all queued PDUs.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<const N: usize> Default for PduQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::data::Llid;

    #[test]
    fn consume_semantics() {
        let mut queue = PduQueue::<2>::new();
        assert_eq!(
            queue.consume_with(|_| Consume::always(Ok(()))),
            Err(Error::Eof)
        );

        queue.push(DataPdu::data(Llid::DataStart, &[1]).unwrap()).unwrap();
        queue.push(DataPdu::data(Llid::DataCont, &[2]).unwrap()).unwrap();
        assert!(queue.is_full());
        assert_eq!(
            queue.push(DataPdu::data(Llid::DataCont, &[3]).unwrap()),
            Err(Error::Eof)
        );

        // Left in place.
        let first = queue.consume_with(|pdu| Consume::never(Ok(pdu.payload()[0])));
        assert_eq!(first, Ok(1));
        assert_eq!(queue.len(), 2);

        // Removed only on success.
        let failed: Result<(), Error> =
            queue.consume_with(|_| Consume::on_success(Err(Error::InvalidLength)));
        assert_eq!(failed, Err(Error::InvalidLength));
        assert_eq!(queue.len(), 2);

        assert_eq!(
            queue.consume_with(|pdu| Consume::always(Ok(pdu.payload()[0]))),
            Ok(1)
        );
        assert_eq!(queue.pop().map(|pdu| pdu.payload()[0]), Some(2));
        assert!(queue.is_empty());
    }
}
