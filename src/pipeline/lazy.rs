//! Tri-state lazy holder for expensive objects.

/// Observable state of a [`Lazy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyState {
    Absent,
    Loading,
    Present,
}

/// A value that is built on first use and may be thrown away again.
///
/// `Loading` is visible while the builder runs, and a failed build returns
/// the holder to `Absent`.
#[derive(Debug)]
pub enum Lazy<T> {
    Absent,
    Loading,
    Present(T),
}

impl<T> Default for Lazy<T> {
    fn default() -> Self {
        Lazy::Absent
    }
}

impl<T> Lazy<T> {
    pub fn state(&self) -> LazyState {
        match self {
            Lazy::Absent => LazyState::Absent,
            Lazy::Loading => LazyState::Loading,
            Lazy::Present(_) => LazyState::Present,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Lazy::Present(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Lazy::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Lazy::Present(value) => Some(value),
            _ => None,
        }
    }

    /// Return the value, building it with `init` if absent.
    pub fn get_or_try_init<E>(&mut self, init: impl FnOnce() -> Result<T, E>) -> Result<&mut T, E> {
        if !self.is_present() {
            *self = Lazy::Loading;
            match init() {
                Ok(value) => *self = Lazy::Present(value),
                Err(e) => {
                    *self = Lazy::Absent;
                    return Err(e);
                }
            }
        }
        match self {
            Lazy::Present(value) => Ok(value),
            // Set to Present above
            _ => unreachable!(),
        }
    }

    /// Mark the holder as being built, for callers that build in several steps.
    pub fn begin_loading(&mut self) {
        *self = Lazy::Loading;
    }

    pub fn fill(&mut self, value: T) -> &mut T {
        *self = Lazy::Present(value);
        match self {
            Lazy::Present(value) => value,
            _ => unreachable!(),
        }
    }

    /// Abandon a build started with [`begin_loading`](Self::begin_loading).
    pub fn abort(&mut self) {
        if matches!(self, Lazy::Loading) {
            *self = Lazy::Absent;
        }
    }

    /// Drop the value. Returns it so the caller controls when it is destroyed.
    pub fn invalidate(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Lazy::Present(value) => Some(value),
            _ => None,
        }
    }
}
