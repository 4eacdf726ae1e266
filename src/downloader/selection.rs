// Quality selection validator
//
// Checks a user's quality choice against the options produced by the most
// recent resolution of the same URL.

use super::errors::DownloadError;
use super::models::{QualityOption, QualitySelector};

/// Options returned by one `resolve_qualities` call
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySnapshot {
    pub url: String,
    pub options: Vec<QualityOption>,
}

impl QualitySnapshot {
    pub fn new(url: impl Into<String>, options: Vec<QualityOption>) -> Self {
        Self {
            url: url.into(),
            options,
        }
    }
}

/// Validate `selector` for `url`.
///
/// `Best` needs no snapshot. Every other selector must match an option of a
/// snapshot taken for the same URL.
pub fn select(
    snapshot: Option<&QualitySnapshot>,
    url: &str,
    selector: &QualitySelector,
) -> Result<QualityOption, DownloadError> {
    let current = snapshot.filter(|s| s.url == url);

    if selector.is_best() {
        return Ok(current
            .and_then(|s| s.options.iter().find(|o| o.is_best()).cloned())
            .unwrap_or_else(QualityOption::best_available));
    }

    let snapshot = match (snapshot, current) {
        (_, Some(current)) => current,
        (Some(stale), None) => {
            return Err(DownloadError::Selection(format!(
                "quality list belongs to {}, resolve {} first",
                stale.url, url
            )))
        }
        (None, None) => {
            return Err(DownloadError::Selection(format!(
                "no quality list for {}, resolve it first",
                url
            )))
        }
    };

    let found = match selector {
        QualitySelector::Best => snapshot.options.iter().find(|o| o.is_best()),
        QualitySelector::Audio => snapshot.options.iter().find(|o| o.is_audio),
        QualitySelector::Height(h) => snapshot
            .options
            .iter()
            .find(|o| !o.is_best() && !o.is_audio && o.height == Some(*h)),
        QualitySelector::Id(id) => {
            let wanted = id.to_lowercase();
            snapshot
                .options
                .iter()
                .find(|o| o.id.to_lowercase() == wanted || o.label.to_lowercase() == wanted)
        }
        QualitySelector::Index(i) => i.checked_sub(1).and_then(|i| snapshot.options.get(i)),
    };

    found.cloned().ok_or_else(|| {
        DownloadError::Selection(format!(
            "{} is not one of the {} options available for {}",
            selector,
            snapshot.options.len(),
            url
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(id: &str, height: Option<u32>, is_audio: bool) -> QualityOption {
        QualityOption {
            id: id.to_string(),
            label: format!("{} label", id),
            requires_merge: height.is_some(),
            height,
            estimated_size: None,
            codec: None,
            is_audio,
        }
    }

    fn snapshot() -> QualitySnapshot {
        QualitySnapshot::new(
            "https://site/watch?v=abc",
            vec![
                option("best", Some(1080), false),
                option("1080p", Some(1080), false),
                option("720p", Some(720), false),
                option("audio", None, true),
            ],
        )
    }

    #[test]
    fn test_best_is_always_valid() {
        let picked = select(None, "https://site/watch?v=zzz", &QualitySelector::Best).unwrap();
        assert!(picked.is_best());

        let snap = snapshot();
        let picked = select(Some(&snap), "https://site/watch?v=abc", &QualitySelector::Best).unwrap();
        assert_eq!(picked.height, Some(1080));
    }

    #[test]
    fn test_matches_by_height_index_and_id() {
        let snap = snapshot();
        let url = "https://site/watch?v=abc";

        assert_eq!(select(Some(&snap), url, &QualitySelector::Height(720)).unwrap().id, "720p");
        assert_eq!(select(Some(&snap), url, &QualitySelector::Index(1)).unwrap().id, "best");
        assert_eq!(select(Some(&snap), url, &QualitySelector::Index(4)).unwrap().id, "audio");
        assert_eq!(
            select(Some(&snap), url, &QualitySelector::Id("720P label".to_string())).unwrap().id,
            "720p"
        );
        assert_eq!(select(Some(&snap), url, &QualitySelector::Audio).unwrap().id, "audio");
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let snap = snapshot();
        let url = "https://site/watch?v=abc";

        for selector in [
            QualitySelector::Height(480),
            QualitySelector::Index(5),
            QualitySelector::Index(0),
            QualitySelector::Id("4k".to_string()),
        ] {
            assert!(
                matches!(select(Some(&snap), url, &selector), Err(DownloadError::Selection(_))),
                "{} should be rejected",
                selector
            );
        }
    }

    #[test]
    fn test_stale_or_missing_snapshot_is_rejected() {
        let snap = snapshot();
        assert!(matches!(
            select(Some(&snap), "https://site/watch?v=other", &QualitySelector::Height(720)),
            Err(DownloadError::Selection(_))
        ));
        assert!(matches!(
            select(None, "https://site/watch?v=abc", &QualitySelector::Height(720)),
            Err(DownloadError::Selection(_))
        ));
    }
}
