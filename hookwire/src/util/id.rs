// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Injectable identifier sources
//!
//! Every component, transport, and scenario receives its own generator rather than
//! sharing a process-wide counter, so tests can pin identifiers deterministically.
use std::sync::atomic::{AtomicU64, Ordering};

pub trait IdGenerator: Send + Sync {
  fn next(&self) -> u64;
}

pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> u64 {
    // `Relaxed` because we only need uniqueness, not ordering against other memory
    self.next.fetch_add(1, Ordering::Relaxed)
  }

  /// Rewind the generator; only meaningful between isolated test runs
  pub fn reset(&self, next: u64) {
    self.next.store(next, Ordering::Relaxed)
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

impl IdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> u64 {
    MonotonicAtomicGenerator::next(self)
  }
}

/// Draws the low 64 bits of random v4 UUIDs; useful when ids must not collide across processes
#[derive(Default, Debug, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
  fn next(&self) -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
  }
}

macro_rules! numeric_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
    #[repr(transparent)]
    #[serde(transparent)]
    pub struct $name(u64);

    impl $name {
      pub fn new(inner: u64) -> Self {
        Self(inner)
      }

      pub fn inner(&self) -> u64 {
        self.0
      }

      pub fn generate(generator: &dyn $crate::util::id::IdGenerator) -> Self {
        Self(generator.next())
      }
    }

    impl From<u64> for $name {
      fn from(inner: u64) -> Self {
        Self::new(inner)
      }
    }

    impl From<$name> for u64 {
      fn from(id: $name) -> u64 {
        id.inner()
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", stringify!($name), self.0)
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
      }
    }
  };
}

pub(crate) use numeric_id;

#[cfg(test)]
mod tests {
  use super::{IdGenerator, MonotonicAtomicGenerator, UuidGenerator};

  numeric_id!(SampleId);

  #[test]
  fn monotonic_generator_counts_up_and_resets() {
    let ids = MonotonicAtomicGenerator::new(7);
    assert_eq!(ids.next(), 7);
    assert_eq!(ids.next(), 8);
    ids.reset(7);
    assert_eq!(SampleId::generate(&ids), SampleId::new(7));
  }

  #[test]
  fn separate_generators_do_not_interfere() {
    let a = MonotonicAtomicGenerator::default();
    let b = MonotonicAtomicGenerator::default();
    a.next();
    a.next();
    assert_eq!(IdGenerator::next(&b), 1);
  }

  #[test]
  fn uuid_generator_is_not_constant() {
    let ids = UuidGenerator;
    assert_ne!(IdGenerator::next(&ids), IdGenerator::next(&ids));
  }

  #[test]
  fn ids_format_with_their_type_name() {
    assert_eq!(format!("{:?}", SampleId::new(3)), "SampleId(3)");
    assert_eq!(SampleId::new(3).to_string(), "3");
  }
}
