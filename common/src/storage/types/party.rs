use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::AppError;

/// Closed set of parties with an ingested program. The slug form is what
/// travels in URLs and is stored on both cache entries and source
/// documents, so the serde representation must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    #[serde(rename = "koalicja-obywatelska")]
    KoalicjaObywatelska,
    #[serde(rename = "prawo-i-sprawiedliwosc")]
    PrawoISprawiedliwosc,
    #[serde(rename = "konfederacja")]
    Konfederacja,
    #[serde(rename = "lewica")]
    Lewica,
    #[serde(rename = "psl")]
    Psl,
    #[serde(rename = "trzecia-droga")]
    TrzeciaDroga,
}

impl Party {
    pub const ALL: [Party; 6] = [
        Party::KoalicjaObywatelska,
        Party::PrawoISprawiedliwosc,
        Party::Konfederacja,
        Party::Lewica,
        Party::Psl,
        Party::TrzeciaDroga,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Party::KoalicjaObywatelska => "koalicja-obywatelska",
            Party::PrawoISprawiedliwosc => "prawo-i-sprawiedliwosc",
            Party::Konfederacja => "konfederacja",
            Party::Lewica => "lewica",
            Party::Psl => "psl",
            Party::TrzeciaDroga => "trzecia-droga",
        }
    }

    /// Full party name as it appears in generation prompts.
    pub fn full_name(self) -> &'static str {
        match self {
            Party::KoalicjaObywatelska => "Koalicja Obywatelska",
            Party::PrawoISprawiedliwosc => "Prawo i Sprawiedliwość",
            Party::Konfederacja => "Konfederacja",
            Party::Lewica => "Lewica",
            Party::Psl => "Polskie Stronnictwo Ludowe",
            Party::TrzeciaDroga => "Trzecia Droga",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Party {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Party::ALL
            .into_iter()
            .find(|party| party.slug() == s)
            .ok_or_else(|| AppError::Validation("Wybierz partię.".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_round_trips_through_from_str() {
        for party in Party::ALL {
            assert_eq!(party.slug().parse::<Party>().unwrap(), party);
        }
    }

    #[test]
    fn serde_uses_the_slug_form() {
        let json = serde_json::to_string(&Party::Lewica).unwrap();
        assert_eq!(json, "\"lewica\"");

        let party: Party = serde_json::from_str("\"prawo-i-sprawiedliwosc\"").unwrap();
        assert_eq!(party, Party::PrawoISprawiedliwosc);
    }

    #[test]
    fn unknown_slug_is_a_validation_error() {
        let err = "partia-piratow".parse::<Party>().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn display_matches_slug() {
        assert_eq!(Party::Psl.to_string(), "psl");
        assert_eq!(Party::Psl.full_name(), "Polskie Stronnictwo Ludowe");
    }
}
