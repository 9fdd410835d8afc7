//! Audio object graph
//!
//! Objects (devices, renderers, capturers) are connected by directed
//! [`AudioLink`]s. Each object owns two link sets:
//! - `source_links`: links where this object is the destination
//! - `dest_links`: links where this object is the source
//!
//! Links hold weak references to both endpoints, so the graph never keeps an
//! object alive. A link is invalidated before it is removed from either set,
//! and a mix pass that still holds it sees `is_valid() == false`.
//!
//! Lock order is always the source's `dest_links` before the destination's
//! `source_links`. Callbacks passed to the `for_each_*` walks run under the
//! link-set lock and must not call back into the graph.

use crate::domain::audio::{Result, StreamFormat};
use crate::domain::device::AudioDevice;
use crate::domain::gain::Gain;
use crate::domain::mixer::Bookkeeping;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of an audio object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Output,
    Input,
    Renderer,
    Capturer,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Output,
        ObjectKind::Input,
        ObjectKind::Renderer,
        ObjectKind::Capturer,
    ];

    pub fn is_device(&self) -> bool {
        matches!(self, ObjectKind::Output | ObjectKind::Input)
    }

    pub fn can_source(&self) -> bool {
        matches!(
            self,
            ObjectKind::Renderer | ObjectKind::Output | ObjectKind::Input
        )
    }

    pub fn can_sink(&self) -> bool {
        matches!(self, ObjectKind::Output | ObjectKind::Capturer)
    }
}

/// Whether `source -> dest` is an allowed link
pub fn is_valid_link(source: ObjectKind, dest: ObjectKind) -> bool {
    source.can_source()
        && dest.can_sink()
        && !(source == ObjectKind::Output && dest == ObjectKind::Output)
}

/// How a link's source delivers frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// Driver ring buffer (devices and loopback)
    RingBuffer,
    /// Client packet queue (renderers)
    Packet,
}

/// Capabilities every concrete object kind exposes to the graph
pub trait AudioNode: Send + Sync {
    fn as_object(&self) -> &AudioObject;

    /// Negotiated format, if any
    fn format(&self) -> Option<StreamFormat> {
        None
    }

    fn as_device(&self) -> Option<&AudioDevice> {
        None
    }

    /// Called on the destination before a new source link is inserted
    fn initialize_source_link(&self, _link: &Arc<AudioLink>) -> Result<()> {
        Ok(())
    }

    /// Called on the source before a new destination link is inserted
    fn initialize_dest_link(&self, _link: &Arc<AudioLink>) -> Result<()> {
        Ok(())
    }

    /// Called on both endpoints once a link is in place, with no lock held
    fn on_link_added(&self) {}
}

/// Directed edge between two objects
pub struct AudioLink {
    source_type: SourceType,
    source_id: ObjectId,
    dest_id: ObjectId,
    source: Weak<dyn AudioNode>,
    dest: Weak<dyn AudioNode>,
    valid: AtomicBool,
    gain: Arc<Gain>,
    bookkeeping: Mutex<Bookkeeping>,
}

impl AudioLink {
    fn new(source: &Arc<dyn AudioNode>, dest: &Arc<dyn AudioNode>) -> Self {
        let source_type = match source.as_object().kind() {
            ObjectKind::Renderer => SourceType::Packet,
            _ => SourceType::RingBuffer,
        };
        let gain = Arc::new(Gain::new());

        Self {
            source_type,
            source_id: source.as_object().id(),
            dest_id: dest.as_object().id(),
            source: Arc::downgrade(source),
            dest: Arc::downgrade(dest),
            valid: AtomicBool::new(true),
            bookkeeping: Mutex::new(Bookkeeping::new(gain.clone())),
            gain,
        }
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn source_id(&self) -> ObjectId {
        self.source_id
    }

    pub fn dest_id(&self) -> ObjectId {
        self.dest_id
    }

    pub fn source(&self) -> Option<Arc<dyn AudioNode>> {
        self.source.upgrade()
    }

    pub fn dest(&self) -> Option<Arc<dyn AudioNode>> {
        self.dest.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn gain(&self) -> &Arc<Gain> {
        &self.gain
    }

    pub fn bookkeeping(&self) -> MutexGuard<'_, Bookkeeping> {
        self.bookkeeping.lock()
    }
}

impl fmt::Debug for AudioLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioLink")
            .field("source_type", &self.source_type)
            .field("source_id", &self.source_id)
            .field("dest_id", &self.dest_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Link bookkeeping shared by every object kind
#[derive(Debug)]
pub struct AudioObject {
    id: ObjectId,
    kind: ObjectKind,
    source_links: Mutex<Vec<Arc<AudioLink>>>,
    dest_links: Mutex<Vec<Arc<AudioLink>>>,
    new_links_allowed: AtomicBool,
}

impl AudioObject {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            id: ObjectId::next(),
            kind,
            source_links: Mutex::new(Vec::new()),
            dest_links: Mutex::new(Vec::new()),
            new_links_allowed: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_output(&self) -> bool {
        self.kind == ObjectKind::Output
    }

    pub fn is_input(&self) -> bool {
        self.kind == ObjectKind::Input
    }

    /// Refuse every future link to or from this object
    pub fn prevent_new_links(&self) {
        self.new_links_allowed.store(false, Ordering::Release);
    }

    pub fn new_links_allowed(&self) -> bool {
        self.new_links_allowed.load(Ordering::Acquire)
    }

    pub fn source_link_count(&self) -> usize {
        self.source_links.lock().len()
    }

    pub fn dest_link_count(&self) -> usize {
        self.dest_links.lock().len()
    }

    /// Copy of the current source links
    pub fn source_links(&self) -> Vec<Arc<AudioLink>> {
        self.source_links.lock().clone()
    }

    pub fn has_source(&self, id: ObjectId) -> bool {
        self.source_links.lock().iter().any(|l| l.source_id == id)
    }

    pub fn has_dest(&self, id: ObjectId) -> bool {
        self.dest_links.lock().iter().any(|l| l.dest_id == id)
    }

    pub fn for_each_source_link(&self, mut f: impl FnMut(&Arc<AudioLink>)) {
        let links = self.source_links.lock();
        links.iter().for_each(|link| f(link));
    }

    pub fn for_each_dest_link(&self, mut f: impl FnMut(&Arc<AudioLink>)) {
        let links = self.dest_links.lock();
        links.iter().for_each(|link| f(link));
    }

    /// Stops at the first link for which `f` returns true
    pub fn for_any_dest_link(&self, mut f: impl FnMut(&Arc<AudioLink>) -> bool) -> bool {
        let links = self.dest_links.lock();
        links.iter().any(|link| f(link))
    }

    /// Remove every link that feeds this object
    pub fn unlink_sources(&self) {
        let links = std::mem::take(&mut *self.source_links.lock());
        for link in links {
            link.invalidate();
            if let Some(source) = link.source() {
                source
                    .as_object()
                    .dest_links
                    .lock()
                    .retain(|l| !Arc::ptr_eq(l, &link));
            }
            trace!(source = %link.source_id, dest = %link.dest_id, "Unlinked source");
        }
    }

    /// Remove every link this object feeds
    pub fn unlink_destinations(&self) {
        let links = std::mem::take(&mut *self.dest_links.lock());
        for link in links {
            link.invalidate();
            if let Some(dest) = link.dest() {
                dest.as_object()
                    .source_links
                    .lock()
                    .retain(|l| !Arc::ptr_eq(l, &link));
            }
            trace!(source = %link.source_id, dest = %link.dest_id, "Unlinked destination");
        }
    }

    pub fn unlink(&self) {
        self.unlink_sources();
        self.unlink_destinations();
    }
}

/// Link `source` to `dest`
///
/// Returns the existing link when the pair is already linked, and `None` when
/// the kinds are incompatible or either endpoint rejects the link.
pub fn link_objects(
    source: &Arc<dyn AudioNode>,
    dest: &Arc<dyn AudioNode>,
) -> Option<Arc<AudioLink>> {
    let source_obj = source.as_object();
    let dest_obj = dest.as_object();

    if !is_valid_link(source_obj.kind(), dest_obj.kind()) {
        debug!(
            source_kind = ?source_obj.kind(),
            dest_kind = ?dest_obj.kind(),
            "Rejected link between incompatible kinds"
        );
        return None;
    }
    if source_obj.id() == dest_obj.id() {
        return None;
    }
    if !source_obj.new_links_allowed() || !dest_obj.new_links_allowed() {
        debug!(source = %source_obj.id(), dest = %dest_obj.id(), "Endpoint no longer accepts links");
        return None;
    }
    if let Some(existing) = find_link(source_obj, dest_obj.id()) {
        return Some(existing);
    }

    let link = Arc::new(AudioLink::new(source, dest));
    if let Err(e) = source.initialize_dest_link(&link) {
        debug!(source = %source_obj.id(), error = %e, "Source rejected link");
        return None;
    }
    if let Err(e) = dest.initialize_source_link(&link) {
        debug!(dest = %dest_obj.id(), error = %e, "Destination rejected link");
        return None;
    }

    {
        let mut dest_links = source_obj.dest_links.lock();
        let mut source_links = dest_obj.source_links.lock();

        if let Some(existing) = dest_links.iter().find(|l| l.dest_id == dest_obj.id()) {
            link.invalidate();
            return Some(existing.clone());
        }
        if !source_obj.new_links_allowed() || !dest_obj.new_links_allowed() {
            link.invalidate();
            return None;
        }

        dest_links.push(link.clone());
        source_links.push(link.clone());
    }

    debug!(source = %source_obj.id(), dest = %dest_obj.id(), "Linked objects");
    source.on_link_added();
    dest.on_link_added();
    Some(link)
}

/// Invalidate `link` and remove it from both endpoints
pub fn remove_link(link: &Arc<AudioLink>) {
    link.invalidate();
    if let Some(source) = link.source() {
        source
            .as_object()
            .dest_links
            .lock()
            .retain(|l| !Arc::ptr_eq(l, link));
    }
    if let Some(dest) = link.dest() {
        dest.as_object()
            .source_links
            .lock()
            .retain(|l| !Arc::ptr_eq(l, link));
    }
}

fn find_link(source: &AudioObject, dest_id: ObjectId) -> Option<Arc<AudioLink>> {
    source
        .dest_links
        .lock()
        .iter()
        .find(|l| l.dest_id == dest_id)
        .cloned()
}
