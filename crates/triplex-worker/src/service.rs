//! The service-body catalog.
//!
//! Service bodies are plain `i32 -> i32` computations resolved from the
//! service tag at startup; there is no dynamic registration. Bodies must
//! be side-effect-free with respect to the worker's broker-facing state,
//! since they run on detached task contexts.

use triplex_common::protocol::ServiceType;

pub type ServiceBody = fn(i32) -> i32;

fn increment(x: i32) -> i32 {
    x.wrapping_add(1)
}

fn double(x: i32) -> i32 {
    x.wrapping_mul(2)
}

fn square(x: i32) -> i32 {
    x.wrapping_mul(x)
}

fn negate(x: i32) -> i32 {
    x.wrapping_neg()
}

/// Resolve a service tag to its computation.
pub fn service_body(service: ServiceType) -> Option<ServiceBody> {
    match service {
        0 => Some(increment),
        1 => Some(double),
        2 => Some(square),
        3 => Some(negate),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_resolve() {
        assert_eq!(service_body(0).unwrap()(41), 42);
        assert_eq!(service_body(1).unwrap()(21), 42);
        assert_eq!(service_body(2).unwrap()(7), 49);
        assert_eq!(service_body(3).unwrap()(5), -5);
    }

    #[test]
    fn unknown_tag_is_none() {
        assert!(service_body(99).is_none());
    }

    #[test]
    fn bodies_wrap_instead_of_overflowing() {
        assert_eq!(service_body(0).unwrap()(i32::MAX), i32::MIN);
        assert_eq!(service_body(3).unwrap()(i32::MIN), i32::MIN);
    }
}
