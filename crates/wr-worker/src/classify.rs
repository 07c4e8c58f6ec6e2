//! Response classification.
//!
//! Maps a delivery attempt's outcome onto the retry state machine:
//!
//! | Response                  | Classification |
//! |---------------------------|----------------|
//! | 2xx                       | success        |
//! | 3xx                       | non-retriable (redirects are misconfiguration) |
//! | 410 Gone                  | non-retriable (consumer opted out) |
//! | 429, 502, 503, 504        | retriable      |
//! | other 4xx                 | non-retriable  |
//! | other 5xx                 | retriable      |
//! | network / timeout / DNS   | retriable      |
//!
//! A route with an explicit `expected_status` narrows the success set to
//! exactly that status; any other 2xx becomes non-retriable.

use crate::deliver::DeliveryResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Retriable,
    NonRetriable,
}

pub fn classify(response: &DeliveryResponse, expected_status: Option<u16>) -> Verdict {
    let status = match response {
        DeliveryResponse::Status(status) => *status,
        DeliveryResponse::Transport(_) => return Verdict::Retriable,
    };

    match status {
        200..=299 => match expected_status {
            Some(expected) if status != expected => Verdict::NonRetriable,
            _ => Verdict::Success,
        },
        410 => Verdict::NonRetriable,
        300..=399 => Verdict::NonRetriable,
        429 | 502 | 503 | 504 => Verdict::Retriable,
        400..=499 => Verdict::NonRetriable,
        500..=599 => Verdict::Retriable,
        _ => Verdict::NonRetriable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> DeliveryResponse {
        DeliveryResponse::Status(code)
    }

    #[test]
    fn two_hundreds_succeed_without_expectation() {
        for code in [200, 201, 202, 204, 299] {
            assert_eq!(classify(&status(code), None), Verdict::Success, "{code}");
        }
    }

    #[test]
    fn expected_status_narrows_success() {
        assert_eq!(classify(&status(202), Some(202)), Verdict::Success);
        assert_eq!(classify(&status(200), Some(202)), Verdict::NonRetriable);
        assert_eq!(classify(&status(204), Some(200)), Verdict::NonRetriable);
        // Narrowing does not touch the failure rows.
        assert_eq!(classify(&status(503), Some(202)), Verdict::Retriable);
    }

    #[test]
    fn gone_and_redirects_are_permanent() {
        assert_eq!(classify(&status(410), None), Verdict::NonRetriable);
        for code in [301, 302, 307, 308] {
            assert_eq!(classify(&status(code), None), Verdict::NonRetriable, "{code}");
        }
    }

    #[test]
    fn throttles_and_gateways_retry() {
        for code in [429, 502, 503, 504] {
            assert_eq!(classify(&status(code), None), Verdict::Retriable, "{code}");
        }
    }

    #[test]
    fn remaining_4xx_permanent_5xx_retriable() {
        for code in [400, 401, 403, 404, 422] {
            assert_eq!(classify(&status(code), None), Verdict::NonRetriable, "{code}");
        }
        for code in [500, 501, 599] {
            assert_eq!(classify(&status(code), None), Verdict::Retriable, "{code}");
        }
    }

    #[test]
    fn transport_errors_retry() {
        let err = DeliveryResponse::Transport("connection refused".to_string());
        assert_eq!(classify(&err, None), Verdict::Retriable);
        assert_eq!(classify(&err, Some(200)), Verdict::Retriable);
    }
}
