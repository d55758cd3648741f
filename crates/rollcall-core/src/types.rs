use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum member name length, counted in characters after trimming.
const MIN_NAME_CHARS: usize = 2;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceBox {
    pub x_min: f32,
    pub y_min: f32,
    pub width: f32,
    pub height: f32,
}

/// A face reported by the detector for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

impl DetectedFace {
    /// Capture this detection as a stored signature.
    pub fn signature(&self) -> FaceSignature {
        FaceSignature::from(self.bbox)
    }
}

/// Geometric descriptor standing in for a face embedding: the width, height
/// and position of the detection box captured at registration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceSignature {
    pub x_min: f32,
    pub y_min: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceSignature {
    /// Half the box perimeter, used as the comparator's normalizer.
    pub fn extent(&self) -> f32 {
        self.width + self.height
    }

    /// True when both dimensions are finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

impl From<FaceBox> for FaceSignature {
    fn from(b: FaceBox) -> Self {
        Self {
            x_min: b.x_min,
            y_min: b.y_min,
            width: b.width,
            height: b.height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Active,
    Inactive,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Active => "active",
            MemberStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemberStatus::Active),
            "inactive" => Ok(MemberStatus::Inactive),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// A registered member. Members without a signature are never matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub face_signature: Option<FaceSignature>,
    pub status: MemberStatus,
    pub created_at: DateTime<Utc>,
}

/// Registration request for a new member.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMember {
    pub name: String,
    pub email: Option<String>,
    pub face_signature: FaceSignature,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("name must be at least 2 characters")]
    NameTooShort,
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("face signature must have positive width and height")]
    InvalidSignature,
    #[error("unknown member status: {0}")]
    UnknownStatus(String),
}

impl NewMember {
    pub fn new(name: impl Into<String>, email: Option<String>, face_signature: FaceSignature) -> Self {
        Self {
            name: name.into(),
            email,
            face_signature,
        }
    }

    /// Normalize and check the request: trims the name, treats an empty
    /// email as absent, and rejects degenerate signatures.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let name = self.name.trim().to_string();
        if name.chars().count() < MIN_NAME_CHARS {
            return Err(ValidationError::NameTooShort);
        }

        let email = match self.email.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(addr) if is_valid_email(addr) => Some(addr.to_string()),
            Some(addr) => return Err(ValidationError::InvalidEmail(addr.to_string())),
        };

        if !self.face_signature.is_valid() {
            return Err(ValidationError::InvalidSignature);
        }

        Ok(Self {
            name,
            email,
            face_signature: self.face_signature,
        })
    }
}

fn is_valid_email(addr: &str) -> bool {
    if addr.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

/// One check-in. Append-only; the core never mutates or deletes records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub member_id: String,
    pub check_in_time: DateTime<Utc>,
    /// Member name joined in by read queries, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
}

/// Best roster candidate for a detected signature.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub member: Member,
    /// Normalized similarity in [0, 1].
    pub score: f32,
    /// Raw `|Δwidth| + |Δheight|` between the stored and detected boxes.
    pub difference: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(width: f32, height: f32) -> FaceSignature {
        FaceSignature { x_min: 0.0, y_min: 0.0, width, height }
    }

    #[test]
    fn test_validate_trims_name_and_drops_empty_email() {
        let m = NewMember::new("  Ada  ", Some("".into()), sig(10.0, 10.0))
            .validate()
            .unwrap();
        assert_eq!(m.name, "Ada");
        assert_eq!(m.email, None);
    }

    #[test]
    fn test_validate_rejects_short_name() {
        let err = NewMember::new(" A ", None, sig(10.0, 10.0)).validate().unwrap_err();
        assert_eq!(err, ValidationError::NameTooShort);
    }

    #[test]
    fn test_validate_email_format() {
        for good in ["a@b.co", "first.last@example.org"] {
            assert!(NewMember::new("Ada", Some(good.into()), sig(1.0, 1.0)).validate().is_ok());
        }
        for bad in ["nope", "@example.com", "a@b", "a@@b.com", "a b@c.com", "a@b..com"] {
            let err = NewMember::new("Ada", Some(bad.into()), sig(1.0, 1.0))
                .validate()
                .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidEmail(_)), "{bad} accepted");
        }
    }

    #[test]
    fn test_validate_rejects_degenerate_signature() {
        let err = NewMember::new("Ada", None, sig(0.0, 10.0)).validate().unwrap_err();
        assert_eq!(err, ValidationError::InvalidSignature);
    }

    #[test]
    fn test_detected_face_wire_shape() {
        let face = DetectedFace {
            bbox: FaceBox { x_min: 1.0, y_min: 2.0, width: 3.0, height: 4.0 },
            score: 0.9,
        };
        let json = serde_json::to_value(face).unwrap();
        assert_eq!(json["box"]["xMin"], 1.0);
        assert_eq!(json["box"]["height"], 4.0);
    }

    #[test]
    fn test_status_round_trip_through_str() {
        assert_eq!("inactive".parse::<MemberStatus>().unwrap(), MemberStatus::Inactive);
        assert_eq!(MemberStatus::default().as_str(), "active");
        assert!("paused".parse::<MemberStatus>().is_err());
    }
}
