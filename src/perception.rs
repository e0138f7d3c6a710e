//! Perception: one immutable [`Snapshot`] per observation of the device.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::device::{DeviceBridge, Point, ScreenSize, UiElement};
use crate::error::{BridgeError, BridgeResult};

/// Screen image plus the recognized elements at one instant
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub screen: ScreenSize,
    #[serde(skip)]
    image: Arc<Vec<u8>>,
    elements: Vec<UiElement>,
}

impl Snapshot {
    /// Build a snapshot from raw parts, normalizing the element list
    pub fn new(screen: ScreenSize, image: Vec<u8>, elements: Vec<UiElement>) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            screen,
            image: Arc::new(image),
            elements: normalize(elements, screen),
        }
    }

    /// PNG bytes of the screen capture
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn shared_image(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.image)
    }

    /// Elements in reading order
    pub fn elements(&self) -> &[UiElement] {
        &self.elements
    }

    pub fn element(&self, id: &str) -> Option<&UiElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn interactive(&self) -> impl Iterator<Item = &UiElement> {
        self.elements.iter().filter(|e| e.interactive)
    }

    pub fn contains_point(&self, point: Point) -> bool {
        self.screen.contains(point)
    }

    /// Non-empty labels on screen
    pub fn labels(&self) -> BTreeSet<&str> {
        self.elements
            .iter()
            .map(|e| e.label.as_str())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Whether two snapshots show the same screen content.
    ///
    /// Element lists are compared when either side has elements; otherwise the
    /// raw images are.
    pub fn same_content_as(&self, other: &Snapshot) -> bool {
        if self.screen != other.screen {
            return false;
        }
        if self.elements.is_empty() && other.elements.is_empty() {
            return self.image == other.image;
        }
        self.elements == other.elements
    }
}

/// Drop empty and off-screen elements, clip to the screen, sort into reading
/// order and make ids unique.
fn normalize(elements: Vec<UiElement>, screen: ScreenSize) -> Vec<UiElement> {
    let mut kept: Vec<UiElement> = elements
        .into_iter()
        .filter(|e| !e.bounds.is_empty())
        .filter_map(|mut e| {
            let clipped = e.bounds.clip(screen);
            if clipped.is_empty() {
                return None;
            }
            e.bounds = clipped;
            Some(e)
        })
        .collect();

    // Stable: equal positions keep document order
    kept.sort_by_key(|e| (e.bounds.top, e.bounds.left));

    let mut used: HashSet<String> = HashSet::with_capacity(kept.len());
    for element in &mut kept {
        if !used.contains(&element.id) {
            used.insert(element.id.clone());
            continue;
        }
        let mut n = 2;
        let mut candidate = format!("{}#{}", element.id, n);
        while used.contains(&candidate) {
            n += 1;
            candidate = format!("{}#{}", element.id, n);
        }
        used.insert(candidate.clone());
        element.id = candidate;
    }
    kept
}

/// Builds snapshots from a device bridge, bounding each bridge call
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    timeout: Duration,
}

impl SnapshotBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn build(&self, bridge: &dyn DeviceBridge) -> BridgeResult<Arc<Snapshot>> {
        let capture = timeout(self.timeout, bridge.capture())
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout))??;
        let elements = timeout(self.timeout, bridge.list_elements())
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout))??;

        let screen = ScreenSize::new(capture.width, capture.height);
        let snapshot = Snapshot::new(screen, capture.image_data, elements);
        tracing::debug!(
            snapshot = %snapshot.id,
            device = bridge.id(),
            elements = snapshot.elements.len(),
            width = screen.width,
            height = screen.height,
            "snapshot built"
        );
        Ok(Arc::new(snapshot))
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
