//! Image pre-pull gating.
//!
//! Before a step is applied, every node must already hold the images the
//! target version needs. The controller publishes an `ImagePullRequest` for
//! the cluster and waits until the matching `ImagePullStatus` reports the
//! request's current resource version as fully processed.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use tracing::debug;

use crate::controller::common::{mark_owned, namespace_of};
use crate::controller::error::Result;
use crate::crd::{
    Cluster, ImagePullRequest, ImagePullRequestSpec, ImagePullStatus, NodeImageList,
};
use crate::store::{Store, modify};

/// Progress of the pre-pull for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrePull {
    /// Every image is present on every node.
    Complete,
    /// Pulls are still running.
    InProgress {
        processed: u32,
        total: u32,
        /// Error of the last failed pull, if any.
        error: Option<String>,
    },
}

impl PrePull {
    pub fn is_complete(&self) -> bool {
        matches!(self, PrePull::Complete)
    }

    /// Status line shown while pulling.
    pub fn status(&self) -> String {
        match self {
            PrePull::Complete => String::new(),
            PrePull::InProgress {
                processed, total, ..
            } => format!("pre-pulling images ({processed}/{total})"),
        }
    }
}

/// Group nodes that need the same set of images.
///
/// Output is deterministic: image lists and node lists are sorted.
pub fn node_image_list(required: &BTreeMap<String, Vec<String>>) -> Vec<NodeImageList> {
    let mut groups: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
    for (node, images) in required {
        let images: Vec<String> = images
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if images.is_empty() {
            continue;
        }
        groups.entry(images).or_default().push(node.clone());
    }
    groups
        .into_iter()
        .map(|(images, nodes)| NodeImageList { nodes, images })
        .collect()
}

/// Upsert the pull request for a cluster and report its progress.
pub async fn ensure_images_pulled<S: Store>(
    store: &S,
    cluster: &Cluster,
    required: &BTreeMap<String, Vec<String>>,
) -> Result<PrePull> {
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);
    let list = node_image_list(required);
    if list.is_empty() {
        debug!(cluster = %name, "No images to pre-pull");
        return Ok(PrePull::Complete);
    }

    let request = modify(
        store,
        &namespace,
        &name,
        || ImagePullRequest::new(&name, ImagePullRequestSpec::default()),
        |req| {
            mark_owned(&mut req.metadata, cluster, None);
            req.spec.node_image_list = list;
            Ok(())
        },
    )
    .await?;
    if request.is_written() {
        debug!(cluster = %name, "Updated image pull request");
    }
    let request = request.into_inner();
    let request_version = request.resource_version().unwrap_or_default();
    let total = u32::try_from(request.spec.total_pulls()).unwrap_or(u32::MAX);

    let status: Option<ImagePullStatus> = store.get(&namespace, &name).await?;
    let progress = match status {
        Some(status) if status.spec.is_satisfied(&request_version) => PrePull::Complete,
        Some(status) if status.spec.request_version == request_version => {
            let s = status.spec;
            let error = (!s.last_processed_error.is_empty()).then(|| {
                format!(
                    "failed to pull image {} on {}: {}",
                    s.last_processed_image, s.last_processed_node, s.last_processed_error
                )
            });
            PrePull::InProgress {
                processed: s.processed_count,
                total: s.total_count,
                error,
            }
        }
        // Missing or describing an older request.
        _ => PrePull::InProgress {
            processed: 0,
            total,
            error: None,
        },
    };
    Ok(progress)
}
