use super::entry::MediaEntry;
use crate::media::MediaType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterType {
    #[default]
    All,
    ImagesOnly,
    VideosOnly,
}

impl FilterType {
    pub fn matches(self, media_type: MediaType) -> bool {
        match self {
            Self::All => true,
            Self::ImagesOnly => media_type == MediaType::Image,
            Self::VideosOnly => media_type == MediaType::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Indices into `entries` that pass `filter`, ordered by capture time.
/// The sort is stable, so equal timestamps keep enumeration order.
pub fn visible_indices(entries: &[MediaEntry], filter: FilterType, order: SortOrder) -> Vec<usize> {
    let mut indices: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| filter.matches(entry.media_type()))
        .map(|(i, _)| i)
        .collect();

    indices.sort_by(|&a, &b| {
        let (a, b) = (entries[a].captured_at(), entries[b].captured_at());
        match order {
            SortOrder::NewestFirst => b.cmp(&a),
            SortOrder::OldestFirst => a.cmp(&b),
        }
    });
    indices
}
