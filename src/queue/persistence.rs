//! Bundle persistence.
//!
//! Each bundle is one XML document under `bundles/`, named by token. A
//! directory bundle uses a `<Bundle>` root; a single-file bundle uses a
//! `<File>` root with exactly one embedded `<Download>`. Dirty bundles are
//! flushed on the save tick and at shutdown; a document that fails to parse
//! drops its bundle with a log entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;

use crate::error::{Error, Result};
use crate::segment::Segment;
use crate::tth::Tth;
use crate::types::{BundleStatus, Cid, HintedUser, Priority, QueueItemStatus, QueueToken};
use crate::utils::now_secs;
use crate::xml::{XmlWriter, attr_map, optional, required};

use super::bundle::Bundle;
use super::item::{ItemFlags, QueueItem, Source};
use super::{QueueManager, QueueState};

/// Current document version
const BUNDLE_VERSION: &str = "2";

fn write_download(w: &mut XmlWriter, item: &QueueItem) {
    w.open(
        "Download",
        &[
            ("Target", item.target.to_string_lossy().into_owned()),
            ("Size", item.size.to_string()),
            ("TempTarget", item.temp_target.to_string_lossy().into_owned()),
            ("TTH", item.tth.to_string()),
            ("Added", item.added.to_string()),
            ("Priority", item.priority.to_i32().to_string()),
            ("MaxSegments", item.max_segments.to_string()),
            ("AutoPriority", if item.auto_priority { "1" } else { "0" }.into()),
        ],
    );
    for segment in item.downloaded.segments() {
        w.empty(
            "Segment",
            &[
                ("Start", segment.start.to_string()),
                ("Size", segment.size.to_string()),
            ],
        );
    }
    for source in &item.sources {
        w.empty(
            "Source",
            &[
                ("CID", source.user.cid.to_string()),
                ("Nick", source.user.nick.clone()),
                ("HubHint", source.user.hub_url.clone()),
            ],
        );
    }
    w.close("Download");
}

fn write_finished(w: &mut XmlWriter, item: &QueueItem, time_finished: i64) {
    w.empty(
        "Finished",
        &[
            ("Target", item.target.to_string_lossy().into_owned()),
            ("Size", item.size.to_string()),
            ("Added", item.added.to_string()),
            ("TTH", item.tth.to_string()),
            ("TimeFinished", time_finished.to_string()),
            ("LastSource", item.last_source.clone()),
        ],
    );
}

fn bundle_to_xml(bundle: &Bundle, items: &HashMap<QueueToken, QueueItem>) -> String {
    let root = if bundle.file_bundle { "File" } else { "Bundle" };
    let mut w = XmlWriter::new();
    w.open(
        root,
        &[
            ("Version", BUNDLE_VERSION.into()),
            ("Token", bundle.token.to_string()),
            ("Target", bundle.target.to_string_lossy().into_owned()),
            ("Added", bundle.added.to_string()),
            ("Date", bundle.remote_time.to_string()),
            ("Priority", bundle.priority.to_i32().to_string()),
            (
                "AddedByAutoSearch",
                if bundle.added_by_auto_search { "1" } else { "0" }.into(),
            ),
            ("ResumeTime", bundle.resume_time.to_string()),
            ("TimeFinished", bundle.time_finished.to_string()),
        ],
    );
    for token in &bundle.queue_items {
        if let Some(item) = items.get(token) {
            write_download(&mut w, item);
        }
    }
    // A file bundle keeps its single item as a Download element for life;
    // directory bundles list finished members separately.
    for token in &bundle.finished_items {
        if let Some(item) = items.get(token) {
            if bundle.file_bundle {
                write_download(&mut w, item);
            } else {
                write_finished(&mut w, item, bundle.time_finished);
            }
        }
    }
    w.close(root);
    w.finish()
}

/// A parsed bundle document
struct LoadedBundle {
    bundle: Bundle,
    queued: Vec<QueueItem>,
    finished: Vec<QueueItem>,
}

fn parse_bundle_doc(path: &Path, doc: &str) -> Result<LoadedBundle> {
    let mut reader = Reader::from_str(doc);
    let mut bundle: Option<Bundle> = None;
    let mut queued: Vec<QueueItem> = Vec::new();
    let mut finished: Vec<QueueItem> = Vec::new();
    let mut current: Option<QueueItem> = None;

    loop {
        let event = reader.read_event().map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        match event {
            XmlEvent::Start(el) | XmlEvent::Empty(el) => {
                let attrs = attr_map(&el);
                match el.name().as_ref() {
                    b"Bundle" | b"File" => {
                        let token: u32 = required(&attrs, "Token", path)?;
                        QueueToken::reserve(token);
                        let target: String = required(&attrs, "Target", path)?;
                        let mut b = Bundle::new(
                            PathBuf::from(target),
                            Priority::from_i32(optional(&attrs, "Priority").unwrap_or(4)),
                            el.name().as_ref() == b"File",
                            optional(&attrs, "Added").unwrap_or_else(now_secs),
                        );
                        b.token = QueueToken(token);
                        b.remote_time = optional(&attrs, "Date").unwrap_or(0);
                        b.added_by_auto_search =
                            attrs.get("AddedByAutoSearch").map(String::as_str) == Some("1");
                        b.resume_time = optional(&attrs, "ResumeTime").unwrap_or(0);
                        b.time_finished = optional(&attrs, "TimeFinished").unwrap_or(0);
                        b.queue_items.clear();
                        bundle = Some(b);
                    }
                    b"Download" => {
                        let target: String = required(&attrs, "Target", path)?;
                        let size: u64 = required(&attrs, "Size", path)?;
                        let tth: Tth = required(&attrs, "TTH", path)?;
                        let temp: String =
                            optional(&attrs, "TempTarget").unwrap_or_else(|| target.clone());
                        let mut item = QueueItem::new(
                            PathBuf::from(target),
                            PathBuf::from(temp),
                            size,
                            tth,
                            Priority::from_i32(optional(&attrs, "Priority").unwrap_or(4)),
                            ItemFlags::default(),
                            optional(&attrs, "MaxSegments").unwrap_or(1),
                            optional(&attrs, "Added").unwrap_or_else(now_secs),
                        );
                        item.auto_priority =
                            attrs.get("AutoPriority").map(String::as_str) == Some("1");
                        current = Some(item);
                    }
                    b"Segment" => {
                        if let Some(item) = current.as_mut() {
                            let start: u64 = required(&attrs, "Start", path)?;
                            let size: u64 = required(&attrs, "Size", path)?;
                            item.downloaded.add(Segment::new(start, size));
                        }
                    }
                    b"Source" => {
                        if let Some(item) = current.as_mut()
                            && let Some(cid) =
                                attrs.get("CID").and_then(|c| Cid::from_base32(c))
                        {
                            item.add_source(Source::new(HintedUser::new(
                                cid,
                                attrs.get("Nick").cloned().unwrap_or_default(),
                                attrs.get("HubHint").cloned().unwrap_or_default(),
                            )));
                        }
                    }
                    b"Finished" => {
                        let target: String = required(&attrs, "Target", path)?;
                        let size: u64 = required(&attrs, "Size", path)?;
                        let tth: Tth = required(&attrs, "TTH", path)?;
                        let mut item = QueueItem::new(
                            PathBuf::from(&target),
                            PathBuf::from(&target),
                            size,
                            tth,
                            Priority::Normal,
                            ItemFlags::default(),
                            1,
                            optional(&attrs, "Added").unwrap_or_else(now_secs),
                        );
                        item.downloaded.add(Segment::new(0, size));
                        item.status = QueueItemStatus::Completed;
                        item.last_source = attrs.get("LastSource").cloned().unwrap_or_default();
                        finished.push(item);
                    }
                    _ => {}
                }
            }
            XmlEvent::End(el) => {
                if el.name().as_ref() == b"Download"
                    && let Some(item) = current.take()
                {
                    queued.push(item);
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    let bundle = bundle.ok_or_else(|| Error::Persistence {
        path: path.to_path_buf(),
        message: "no Bundle or File root element".into(),
    })?;
    Ok(LoadedBundle {
        bundle,
        queued,
        finished,
    })
}

fn install_bundle(state: &mut QueueState, mut loaded: LoadedBundle) {
    let token = loaded.bundle.token;
    for mut item in loaded.queued.drain(..) {
        item.bundle = Some(token);
        if item.downloaded.covers_file(item.size) {
            // Fully covered on disk (file-bundle document after completion).
            item.status = QueueItemStatus::Completed;
            loaded.bundle.finished_items.push(item.token);
            state.index_item(&item);
            state.items.insert(item.token, item);
            continue;
        }
        loaded.bundle.queue_items.push(item.token);
        for source in &item.sources {
            state.user_queue.add(source.user.cid, item.priority, item.token);
        }
        state.index_item(&item);
        state.items.insert(item.token, item);
    }
    for mut item in loaded.finished.drain(..) {
        item.bundle = Some(token);
        loaded.bundle.finished_items.push(item.token);
        state.index_item(&item);
        state.items.insert(item.token, item);
    }

    // Restored bundles re-enter the lifecycle where they left off: anything
    // fully finished skips straight to Completed, the rest queues.
    loaded.bundle.status = BundleStatus::New;
    if loaded.bundle.queue_items.is_empty() && !loaded.bundle.finished_items.is_empty() {
        loaded.bundle.set_status(BundleStatus::Queued);
        loaded.bundle.set_status(BundleStatus::Downloaded);
        loaded.bundle.set_status(BundleStatus::Completed);
    } else {
        loaded.bundle.set_status(BundleStatus::Queued);
    }
    loaded.bundle.dirty = false;
    state.bundles.insert(token, loaded.bundle);
}

impl QueueManager {
    fn bundle_file(&self, token: QueueToken) -> PathBuf {
        self.inner.config.bundles_dir().join(format!("{token}.xml"))
    }

    /// Persist one bundle immediately
    pub(crate) async fn save_bundle_now(&self, token: QueueToken) {
        let (doc, path) = {
            let mut state = self.inner.state.write().await;
            let Some(bundle) = state.bundles.get_mut(&token) else {
                return;
            };
            bundle.dirty = false;
            let bundle = state.bundles.get(&token).cloned();
            let Some(bundle) = bundle else { return };
            (bundle_to_xml(&bundle, &state.items), self.bundle_file(token))
        };
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::error!(error = %e, "cannot create bundles directory");
            return;
        }
        if let Err(e) = tokio::fs::write(&path, doc).await {
            // Retried on the next save tick; the bundle stays dirty.
            tracing::error!(bundle = token.get(), error = %e, "bundle save failed");
            let mut state = self.inner.state.write().await;
            if let Some(bundle) = state.bundles.get_mut(&token) {
                bundle.dirty = true;
            }
        }
    }

    /// Flush every dirty bundle; called on the save tick and at shutdown
    pub async fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<QueueToken> = {
            let state = self.inner.state.read().await;
            state
                .bundles
                .values()
                .filter(|b| b.dirty)
                .map(|b| b.token)
                .collect()
        };
        for token in dirty {
            self.save_bundle_now(token).await;
        }
        Ok(())
    }

    pub(crate) async fn delete_bundle_file(&self, token: QueueToken) {
        let path = self.bundle_file(token);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(bundle = token.get(), error = %e, "bundle document removal failed");
        }
    }

    /// Load every persisted bundle; corrupt documents are dropped with a log
    /// entry. Imports the legacy `queue.xml` once when no bundles exist.
    pub(crate) async fn load_bundles(&self) -> Result<()> {
        let dir = self.inner.config.bundles_dir();
        let mut loaded = 0usize;
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            let mut state = self.inner.state.write().await;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                    continue;
                }
                let doc = match tokio::fs::read_to_string(&path).await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "unreadable bundle document");
                        continue;
                    }
                };
                match parse_bundle_doc(&path, &doc) {
                    Ok(parsed) => {
                        install_bundle(&mut state, parsed);
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            path = %path.display(),
                            error = %e,
                            "corrupt bundle document dropped"
                        );
                    }
                }
            }
        }

        if loaded == 0 {
            self.import_legacy_queue().await?;
        } else {
            tracing::info!(bundles = loaded, "queue restored");
        }
        Ok(())
    }

    /// Import the legacy single-document `queue.xml`, then move it aside
    async fn import_legacy_queue(&self) -> Result<()> {
        let legacy = self.inner.config.state_dir.join("queue.xml");
        let doc = match tokio::fs::read_to_string(&legacy).await {
            Ok(d) => d,
            Err(_) => return Ok(()),
        };

        let mut reader = Reader::from_str(&doc);
        let mut imported = 0usize;
        {
            let mut state = self.inner.state.write().await;
            let mut current: Option<QueueItem> = None;
            loop {
                match reader.read_event() {
                    Ok(XmlEvent::Start(el)) | Ok(XmlEvent::Empty(el)) => {
                        let attrs = attr_map(&el);
                        match el.name().as_ref() {
                            b"Download" => {
                                let (Some(target), Some(size), Some(tth)) = (
                                    attrs.get("Target").cloned(),
                                    optional::<u64>(&attrs, "Size"),
                                    attrs.get("TTH").and_then(|t| Tth::from_base32(t)),
                                ) else {
                                    continue;
                                };
                                let mut item = QueueItem::new(
                                    PathBuf::from(&target),
                                    attrs
                                        .get("TempTarget")
                                        .map(PathBuf::from)
                                        .unwrap_or_else(|| PathBuf::from(&target)),
                                    size,
                                    tth,
                                    Priority::from_i32(
                                        optional(&attrs, "Priority").unwrap_or(4),
                                    ),
                                    ItemFlags::default(),
                                    optional(&attrs, "MaxSegments").unwrap_or(1),
                                    optional(&attrs, "Added").unwrap_or_else(now_secs),
                                );
                                item.auto_priority =
                                    attrs.get("AutoPriority").map(String::as_str) == Some("1");
                                current = Some(item);
                            }
                            b"Segment" => {
                                if let (Some(item), Some(start), Some(size)) = (
                                    current.as_mut(),
                                    optional::<u64>(&attrs, "Start"),
                                    optional::<u64>(&attrs, "Size"),
                                ) {
                                    item.downloaded.add(Segment::new(start, size));
                                }
                            }
                            b"Source" => {
                                if let Some(item) = current.as_mut()
                                    && let Some(cid) =
                                        attrs.get("CID").and_then(|c| Cid::from_base32(c))
                                {
                                    item.add_source(Source::new(HintedUser::new(
                                        cid,
                                        attrs.get("Nick").cloned().unwrap_or_default(),
                                        attrs.get("HubHint").cloned().unwrap_or_default(),
                                    )));
                                }
                            }
                            _ => {}
                        }
                    }
                    Ok(XmlEvent::End(el)) => {
                        if el.name().as_ref() == b"Download"
                            && let Some(item) = current.take()
                        {
                            let bundle =
                                Bundle::new(item.target.clone(), item.priority, true, item.added);
                            let token = bundle.token;
                            install_bundle(
                                &mut state,
                                LoadedBundle {
                                    bundle,
                                    queued: vec![item],
                                    finished: Vec::new(),
                                },
                            );
                            if let Some(b) = state.bundles.get_mut(&token) {
                                b.dirty = true;
                            }
                            imported += 1;
                        }
                    }
                    Ok(XmlEvent::Eof) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "legacy queue.xml unparseable, skipping import");
                        break;
                    }
                }
            }
        }

        if imported > 0 {
            tracing::info!(downloads = imported, "imported legacy queue.xml");
            self.flush_dirty().await?;
        }
        let _ = tokio::fs::rename(&legacy, legacy.with_extension("xml.bak")).await;
        Ok(())
    }
}
