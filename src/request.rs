//! Inbound path requests.
//!
//! The map client asks for an animal's path with local wall-clock times:
//!
//! ```json
//! {"animal_imei": "860000000000001", "start_time": "2024-05-01 08:00:00", "end_time": "2024-05-01 18:00:00"}
//! ```

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Wall-clock format of request times.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Length of a tracker IMEI.
pub const IMEI_LENGTH: usize = 15;

/// Request for one animal's path between two local times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    pub animal_imei: String,
    pub start_time: String,
    pub end_time: String,
}

impl PathRequest {
    /// Parse a JSON body and check the IMEI.
    ///
    /// # Example
    /// ```
    /// use chrono::{FixedOffset, TimeZone, Utc};
    /// use herd_tracks::PathRequest;
    ///
    /// let req = PathRequest::from_json(
    ///     r#"{"animal_imei":"860000000000001","start_time":"2024-05-01 08:00:00","end_time":"2024-05-01 18:00:00"}"#,
    /// ).unwrap();
    ///
    /// let almaty = FixedOffset::east_opt(5 * 3600).unwrap();
    /// let (start, end) = req.time_range(almaty).unwrap();
    /// assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap());
    /// assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap());
    /// ```
    pub fn from_json(body: &str) -> Result<Self, RequestError> {
        let request: Self = serde_json::from_str(body)?;
        validate_imei(&request.animal_imei)?;
        Ok(request)
    }

    /// Start and end converted from local time at `offset` to UTC.
    pub fn time_range(
        &self,
        offset: FixedOffset,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), RequestError> {
        let start = parse_local_time("start_time", &self.start_time, offset)?;
        let end = parse_local_time("end_time", &self.end_time, offset)?;
        Ok((start, end))
    }
}

/// Check that an IMEI is exactly 15 ASCII digits.
pub fn validate_imei(imei: &str) -> Result<(), RequestError> {
    if imei.len() == IMEI_LENGTH && imei.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(RequestError::InvalidImei(imei.to_string()))
    }
}

fn parse_local_time(
    field: &'static str,
    value: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, RequestError> {
    let invalid = || RequestError::InvalidTime {
        field,
        value: value.to_string(),
    };

    let naive = NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT).map_err(|_| invalid())?;
    // A fixed offset has no gaps or folds
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let req = PathRequest::from_json(
            r#"{"animal_imei":"123456789012345","start_time":"2024-01-31 23:30:00","end_time":"2024-02-01 01:00:00"}"#,
        )
        .unwrap();
        assert_eq!(req.animal_imei, "123456789012345");

        let (start, end) = req.time_range(offset(5)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 31, 18, 30, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 31, 20, 0, 0).unwrap());

        let (start_utc, _) = req.time_range(offset(0)).unwrap();
        assert_eq!(start_utc, Utc.with_ymd_and_hms(2024, 1, 31, 23, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_imei() {
        for imei in ["", "12345", "1234567890123456", "12345678901234x", "１２３４５６７８９０１２３４５"] {
            assert!(
                matches!(validate_imei(imei), Err(RequestError::InvalidImei(_))),
                "{:?}",
                imei
            );
        }
        assert!(validate_imei("860000000000001").is_ok());

        let err = PathRequest::from_json(
            r#"{"animal_imei":"42","start_time":"2024-01-01 00:00:00","end_time":"2024-01-01 01:00:00"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidImei(_)));
    }

    #[test]
    fn test_missing_field_is_json_error() {
        let err = PathRequest::from_json(r#"{"animal_imei":"860000000000001"}"#).unwrap_err();
        assert!(matches!(err, RequestError::Json(_)));
    }

    #[test]
    fn test_invalid_time() {
        let req = PathRequest {
            animal_imei: "860000000000001".to_string(),
            start_time: "2024-01-01T00:00:00".to_string(),
            end_time: "2024-01-01 01:00:00".to_string(),
        };
        match req.time_range(offset(5)) {
            Err(RequestError::InvalidTime { field, value }) => {
                assert_eq!(field, "start_time");
                assert_eq!(value, "2024-01-01T00:00:00");
            }
            other => panic!("expected invalid time, got {:?}", other),
        }

        let req = PathRequest {
            end_time: "2024-02-30 00:00:00".to_string(),
            start_time: "2024-01-01 00:00:00".to_string(),
            ..req
        };
        assert!(matches!(
            req.time_range(offset(5)),
            Err(RequestError::InvalidTime { field: "end_time", .. })
        ));
    }
}
