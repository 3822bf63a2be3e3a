//! Recent-hubs list.
//!
//! A bounded most-recently-used list of hubs, persisted to `recents.xml`.

use std::path::PathBuf;

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::Event;
use crate::utils::now_secs;
use crate::xml::{XmlWriter, attr_map};

/// Most recents kept
const MAX_RECENTS: usize = 20;

/// One recently opened hub
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecentHub {
    /// Hub URL
    pub url: String,
    /// Hub name as last seen
    pub name: String,
    /// Last opened, seconds since the epoch
    pub last_opened: i64,
}

/// The recents manager
pub struct RecentManager {
    file: PathBuf,
    entries: RwLock<Vec<RecentHub>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl RecentManager {
    /// Create the manager and load `recents.xml`
    pub async fn new(
        state_dir: &std::path::Path,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Result<Self> {
        let manager = Self {
            file: state_dir.join("recents.xml"),
            entries: RwLock::new(Vec::new()),
            event_tx,
        };
        manager.load().await?;
        Ok(manager)
    }

    /// Record a hub visit, bumping it to the front
    pub async fn touch(&self, url: &str, name: &str) {
        {
            let mut entries = self.entries.write().await;
            entries.retain(|e| e.url != url);
            entries.insert(
                0,
                RecentHub {
                    url: url.to_string(),
                    name: name.to_string(),
                    last_opened: now_secs(),
                },
            );
            entries.truncate(MAX_RECENTS);
        }
        let _ = self.event_tx.send(Event::RecentsUpdated);
    }

    /// Remove one entry
    pub async fn remove(&self, url: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|e| e.url != url);
            entries.len() != before
        };
        if removed {
            let _ = self.event_tx.send(Event::RecentsUpdated);
        }
        removed
    }

    /// Entries, most recent first
    pub async fn list(&self) -> Vec<RecentHub> {
        self.entries.read().await.clone()
    }

    /// Write `recents.xml`
    pub async fn save(&self) -> Result<()> {
        let entries = self.entries.read().await;
        let mut w = XmlWriter::new();
        w.open("Recents", &[("Version", "1".into())]);
        for entry in entries.iter() {
            w.empty(
                "Hub",
                &[
                    ("Url", entry.url.clone()),
                    ("Name", entry.name.clone()),
                    ("LastOpened", entry.last_opened.to_string()),
                ],
            );
        }
        w.close("Recents");
        drop(entries);

        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.file, w.finish()).await?;
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let doc = match tokio::fs::read_to_string(&self.file).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = Reader::from_str(&doc);
        let mut entries = self.entries.write().await;
        loop {
            match reader.read_event() {
                Ok(XmlEvent::Empty(el)) | Ok(XmlEvent::Start(el))
                    if el.name().as_ref() == b"Hub" =>
                {
                    let attrs = attr_map(&el);
                    if let Some(url) = attrs.get("Url") {
                        entries.push(RecentHub {
                            url: url.clone(),
                            name: attrs.get("Name").cloned().unwrap_or_default(),
                            last_opened: attrs
                                .get("LastOpened")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0),
                        });
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::Persistence {
                        path: self.file.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        entries.truncate(MAX_RECENTS);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(dir: &std::path::Path) -> RecentManager {
        let (tx, _rx) = tokio::sync::broadcast::channel(16);
        RecentManager::new(dir, tx).await.unwrap()
    }

    #[tokio::test]
    async fn touch_moves_entries_to_the_front() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;

        m.touch("adc://a:1511", "Hub A").await;
        m.touch("adc://b:1511", "Hub B").await;
        m.touch("adc://a:1511", "Hub A").await;

        let list = m.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].url, "adc://a:1511");
        assert_eq!(list[1].url, "adc://b:1511");
    }

    #[tokio::test]
    async fn list_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        for i in 0..30 {
            m.touch(&format!("adc://hub{i}:1511"), "x").await;
        }
        assert_eq!(m.list().await.len(), MAX_RECENTS);
        assert_eq!(m.list().await[0].url, "adc://hub29:1511");
    }

    #[tokio::test]
    async fn recents_round_trip_through_xml() {
        let dir = tempfile::tempdir().unwrap();
        {
            let m = manager(dir.path()).await;
            m.touch("adcs://secure:1511", "Secure Hub").await;
            m.touch("dchub://legacy:411", "Legacy").await;
            m.save().await.unwrap();
        }
        let m = manager(dir.path()).await;
        let list = m.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].url, "dchub://legacy:411");
        assert_eq!(list[0].name, "Legacy");
        assert!(list[0].last_opened > 0);
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_changed() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.touch("adc://a:1511", "A").await;
        assert!(m.remove("adc://a:1511").await);
        assert!(!m.remove("adc://a:1511").await);
        assert!(m.list().await.is_empty());
    }
}
