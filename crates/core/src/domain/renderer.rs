//! Minimal playback stream
//!
//! Renderers are packet sources. This core only routes them: the device
//! manager links each renderer to the throttle output and the default
//! output, and the renderer reports play/pause to the admin and realizes
//! usage volume as the source stage of its links.

use crate::domain::admin::{AudioAdmin, RenderUsage, Usage};
use crate::domain::audio::{AudioError, Result, StreamFormat};
use crate::domain::gain::{combine_gains, volume_to_db, MAX_GAIN_DB, MIN_GAIN_DB, UNITY_GAIN_DB};
use crate::domain::object::{AudioLink, AudioNode, AudioObject, ObjectId, ObjectKind};
use crate::domain::volume::{StreamVolume, StreamVolumeManager, VolumeCommand};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct RendererState {
    format: Option<StreamFormat>,
    usage: RenderUsage,
    stream_gain_db: f32,
    realized_gain_db: f32,
}

pub struct AudioRenderer {
    object: AudioObject,
    weak_self: Weak<AudioRenderer>,
    state: Mutex<RendererState>,
    muted: AtomicBool,
    playing: AtomicBool,
    shutdown: AtomicBool,
    admin: Arc<AudioAdmin>,
    volume: Arc<StreamVolumeManager>,
}

impl AudioRenderer {
    pub fn new(
        usage: RenderUsage,
        admin: Arc<AudioAdmin>,
        volume: Arc<StreamVolumeManager>,
    ) -> Arc<Self> {
        let renderer = Arc::new_cyclic(|weak_self| Self {
            object: AudioObject::new(ObjectKind::Renderer),
            weak_self: weak_self.clone(),
            state: Mutex::new(RendererState {
                format: None,
                usage,
                stream_gain_db: UNITY_GAIN_DB,
                realized_gain_db: UNITY_GAIN_DB,
            }),
            muted: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            admin,
            volume,
        });
        let stream: Arc<dyn StreamVolume> = renderer.clone();
        renderer.volume.add_stream(Arc::downgrade(&stream));
        renderer
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn usage(&self) -> RenderUsage {
        self.state.lock().usage
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Set the stream format; the caller reselects outputs afterwards
    pub fn set_format(&self, format: StreamFormat) -> Result<()> {
        if let Err(e) = format.validate() {
            warn!(renderer = %self.id(), error = %e, "Rejected renderer format");
            self.shutdown();
            return Err(e);
        }
        self.state.lock().format = Some(format);
        Ok(())
    }

    pub fn play(&self) {
        if self.is_shutdown() || self.playing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.admin
            .update_renderer_state(self.usage(), true, self.id());
    }

    pub fn pause(&self) {
        if !self.playing.swap(false, Ordering::AcqRel) {
            return;
        }
        self.admin
            .update_renderer_state(self.usage(), false, self.id());
    }

    pub fn set_gain(&self, gain_db: f32) -> Result<()> {
        if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&gain_db) {
            warn!(renderer = %self.id(), gain_db, "Renderer gain out of range");
            self.shutdown();
            return Err(AudioError::InvalidArgument(format!("gain {gain_db} dB")));
        }
        self.state.lock().stream_gain_db = gain_db;
        self.notify_volume();
        Ok(())
    }

    pub fn set_mute(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::AcqRel) != muted {
            self.notify_volume();
        }
    }

    pub fn set_usage(&self, usage: RenderUsage) {
        let old = std::mem::replace(&mut self.state.lock().usage, usage);
        if old == usage {
            return;
        }
        if self.is_playing() {
            self.admin.update_renderer_state(old, false, self.id());
            self.admin.update_renderer_state(usage, true, self.id());
        }
        self.notify_volume();
    }

    fn notify_volume(&self) {
        if let Some(me) = self.weak_self.upgrade() {
            let stream: Arc<dyn StreamVolume> = me;
            self.volume.notify_stream_changed(&stream);
        }
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pause();
        self.object.prevent_new_links();
        self.object.unlink();
        self.volume.remove_stream(self.id());
        debug!(renderer = %self.id(), "Renderer shut down");
    }
}

impl AudioNode for AudioRenderer {
    fn as_object(&self) -> &AudioObject {
        &self.object
    }

    fn format(&self) -> Option<StreamFormat> {
        self.state.lock().format
    }

    fn initialize_dest_link(&self, link: &Arc<AudioLink>) -> Result<()> {
        if self.format().is_none() {
            return Err(AudioError::BadState("renderer format not set".into()));
        }
        link.gain()
            .set_source_gain(self.state.lock().realized_gain_db);
        Ok(())
    }
}

impl StreamVolume for AudioRenderer {
    fn stream_id(&self) -> ObjectId {
        self.id()
    }

    fn stream_usage(&self) -> Usage {
        Usage::Render(self.usage())
    }

    fn stream_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    fn realize_volume(&self, command: VolumeCommand) {
        let db = {
            let mut state = self.state.lock();
            let db = combine_gains(
                combine_gains(volume_to_db(command.volume), state.stream_gain_db),
                command.gain_db_adjustment,
            );
            state.realized_gain_db = db;
            db
        };
        self.object
            .for_each_dest_link(|link| link.gain().set_source_gain(db));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::admin::BehaviorGain;
    use crate::domain::audio::SampleFormat;
    use crate::domain::gain::MUTED_GAIN_DB;
    use crate::domain::object::link_objects;

    fn renderer() -> (Arc<AudioRenderer>, Arc<AudioAdmin>) {
        let volume = Arc::new(StreamVolumeManager::new());
        let admin = Arc::new(AudioAdmin::new(BehaviorGain::default(), volume.clone()));
        (
            AudioRenderer::new(RenderUsage::Media, admin.clone(), volume),
            admin,
        )
    }

    struct Sink(AudioObject);

    impl AudioNode for Sink {
        fn as_object(&self) -> &AudioObject {
            &self.0
        }
    }

    #[test]
    fn test_play_pause_reports_activity() {
        let (renderer, admin) = renderer();
        renderer.play();
        assert!(admin.is_active(Usage::Render(RenderUsage::Media)));

        renderer.set_usage(RenderUsage::Interruption);
        assert!(!admin.is_active(Usage::Render(RenderUsage::Media)));
        assert!(admin.is_active(Usage::Render(RenderUsage::Interruption)));

        renderer.shutdown();
        assert!(!admin.is_active(Usage::Render(RenderUsage::Interruption)));
    }

    #[test]
    fn test_links_need_format() {
        let (renderer, _admin) = renderer();
        let source: Arc<dyn AudioNode> = renderer.clone();
        let sink: Arc<dyn AudioNode> = Arc::new(Sink(AudioObject::new(ObjectKind::Output)));
        assert!(link_objects(&source, &sink).is_none());

        renderer
            .set_format(StreamFormat::new(SampleFormat::Float, 2, 48_000))
            .expect("format");
        let link = link_objects(&source, &sink).expect("link");

        renderer.set_mute(true);
        assert_eq!(link.gain().source_gain_db(), MUTED_GAIN_DB);
        renderer.set_mute(false);
        renderer.set_gain(-6.0).expect("gain");
        assert_eq!(link.gain().source_gain_db(), -6.0);
    }

    #[test]
    fn test_bad_gain_shuts_down() {
        let (renderer, _admin) = renderer();
        assert!(renderer.set_gain(30.0).is_err());
        assert!(renderer.is_shutdown());
    }
}
