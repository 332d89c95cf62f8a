//! One spectrum of lookahead over any pull source.
//!
//! Leaves, archives and containers all satisfy the [`SpectraSource`](super::SpectraSource)
//! buffering contract by wrapping their own pulling logic in a [`Lookahead`].
use crate::spectrum::Spectrum;

use super::traits::SourceError;

/// The raw pulling half of a source, without any buffering
pub(crate) trait PullSpectra {
    fn pull(&mut self) -> Result<Option<Spectrum>, SourceError>;
}

#[derive(Debug)]
pub(crate) struct Lookahead<P: PullSpectra> {
    inner: P,
    next: Option<Spectrum>,
    current: Option<Spectrum>,
    deferred: Option<SourceError>,
    count_read: u64,
}

impl<P: PullSpectra> Lookahead<P> {
    /// Wrap `inner` without buffering anything yet
    pub(crate) fn new(inner: P) -> Self {
        Self {
            inner,
            next: None,
            current: None,
            deferred: None,
            count_read: 0,
        }
    }

    /// Wrap `inner` and buffer its first spectrum
    pub(crate) fn primed(inner: P) -> Result<Self, SourceError> {
        let mut this = Self::new(inner);
        this.prime()?;
        Ok(this)
    }

    fn prime(&mut self) -> Result<(), SourceError> {
        self.next = self.inner.pull()?;
        Ok(())
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next.is_some() || self.deferred.is_some()
    }

    pub(crate) fn advance(&mut self) -> Result<Option<Spectrum>, SourceError> {
        let Some(spectrum) = self.next.take() else {
            return match self.deferred.take() {
                Some(err) => Err(err),
                None => Ok(None),
            };
        };
        match self.inner.pull() {
            Ok(next) => self.next = next,
            Err(err) => self.deferred = Some(err),
        }
        self.count_read += 1;
        self.current = Some(spectrum.clone());
        Ok(Some(spectrum))
    }

    pub(crate) fn current(&self) -> Option<&Spectrum> {
        self.current.as_ref()
    }

    pub(crate) fn count_read(&self) -> u64 {
        self.count_read
    }

    pub(crate) fn inner(&self) -> &P {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut P {
        &mut self.inner
    }

    /// Drop everything buffered and the counters, keeping the inner source
    pub(crate) fn clear(&mut self) {
        self.next = None;
        self.current = None;
        self.deferred = None;
        self.count_read = 0;
    }

    /// Swap in a freshly opened inner source and buffer its first spectrum
    pub(crate) fn reset(&mut self, inner: P) -> Result<(), SourceError> {
        self.clear();
        self.inner = inner;
        self.prime()
    }

    /// Buffer a spectrum if none is pending, after the inner source gained input
    pub(crate) fn refill(&mut self) -> Result<(), SourceError> {
        if self.next.is_none() && self.deferred.is_none() {
            self.next = self.inner.pull()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Counting {
        remaining: u64,
        fail_at: Option<u64>,
    }

    impl PullSpectra for Counting {
        fn pull(&mut self) -> Result<Option<Spectrum>, SourceError> {
            if self.fail_at == Some(self.remaining) {
                self.fail_at = None;
                return Err(SourceError::malformed(self.remaining, "boom"));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Spectrum {
                read_id: self.remaining,
                ..Default::default()
            }))
        }
    }

    #[test]
    fn test_buffering() -> Result<(), SourceError> {
        let mut buffer = Lookahead::primed(Counting {
            remaining: 2,
            fail_at: None,
        })?;
        assert!(buffer.has_next());
        assert!(buffer.current().is_none());
        assert_eq!(buffer.advance()?.unwrap().read_id, 1);
        assert_eq!(buffer.current().unwrap().read_id, 1);
        assert_eq!(buffer.advance()?.unwrap().read_id, 0);
        assert!(!buffer.has_next());
        assert!(buffer.advance()?.is_none());
        assert_eq!(buffer.count_read(), 2);
        Ok(())
    }

    #[test]
    fn test_deferred_error() -> Result<(), SourceError> {
        let mut buffer = Lookahead::primed(Counting {
            remaining: 3,
            fail_at: Some(2),
        })?;
        assert!(buffer.advance()?.is_some());
        assert!(buffer.has_next());
        assert!(matches!(
            buffer.advance(),
            Err(SourceError::MalformedRecord { .. })
        ));
        Ok(())
    }
}
