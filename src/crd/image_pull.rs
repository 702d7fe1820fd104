//! Image pull contract with the image pull subsystem.
//!
//! The upgrade controller writes an `ImagePullRequest` per cluster; the image
//! pull subsystem pulls the listed images onto the listed nodes and reports
//! progress in an `ImagePullStatus` of the same name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ImagePullRequest lists images to pre-pull onto nodes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "ImagePullRequest",
    plural = "imagepullrequests",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullRequestSpec {
    /// Groups of nodes with the images each group needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_image_list: Vec<NodeImageList>,
}

/// Images to pull onto a set of nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeImageList {
    /// Node names.
    pub nodes: Vec<String>,

    /// Image references.
    pub images: Vec<String>,
}

impl ImagePullRequestSpec {
    /// Total number of (node, image) pulls this request asks for.
    pub fn total_pulls(&self) -> usize {
        self.node_image_list
            .iter()
            .map(|l| l.nodes.len() * l.images.len())
            .sum()
    }
}

/// ImagePullStatus reports progress of the pull request with the same name.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "ImagePullStatus",
    plural = "imagepullstatuses",
    namespaced,
    printcolumn = r#"{"name":"Processed","type":"integer","jsonPath":".spec.processedCount"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".spec.totalCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullStatusSpec {
    /// Resource version of the request this status describes.
    #[serde(default)]
    pub request_version: String,

    /// Number of (node, image) pulls processed so far.
    #[serde(default)]
    pub processed_count: u32,

    /// Total number of (node, image) pulls in the request.
    #[serde(default)]
    pub total_count: u32,

    /// Node of the last processed pull.
    #[serde(default)]
    pub last_processed_node: String,

    /// Image of the last processed pull.
    #[serde(default)]
    pub last_processed_image: String,

    /// Error of the last processed pull, empty on success.
    #[serde(default)]
    pub last_processed_error: String,
}

impl ImagePullStatusSpec {
    /// Check whether this status reports completion of the given request version.
    pub fn is_satisfied(&self, request_version: &str) -> bool {
        self.request_version == request_version && self.processed_count == self.total_count
    }
}
