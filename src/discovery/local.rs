use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Announce, AnnounceEvent, CandidateSink, Discovery};
use crate::swarm::Role;
use crate::torrent::InfoHash;

struct Member {
    role: Role,
    sink: Weak<dyn CandidateSink>,
}

type Members = HashMap<SocketAddr, Member>;

/// An in-process peer directory shared by several announcers.
///
/// Every announce registers the announcer's listen address under the
/// torrent's info-hash. The announcer is told about the members already
/// registered, and those members are told about the announcer. Two seeders
/// are never introduced to each other. A `Stopped` announce removes the
/// address.
///
/// Sinks are held weakly so a directory never keeps an engine alive.
#[derive(Clone, Default)]
pub struct LocalDirectory {
    torrents: Arc<Mutex<HashMap<InfoHash, Members>>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collaborator that delivers candidates to `sink`.
    pub fn client(&self, sink: Arc<dyn CandidateSink>) -> Arc<LocalDirectoryClient> {
        Arc::new(LocalDirectoryClient {
            directory: self.clone(),
            sink: Arc::downgrade(&sink),
        })
    }

    /// Addresses currently registered for `info_hash`, in ascending order.
    pub fn peers(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        let torrents = self.torrents.lock();
        let mut peers: Vec<SocketAddr> = torrents
            .get(info_hash)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    fn register(&self, announce: &Announce, sink: &Weak<dyn CandidateSink>) {
        let Some(addr) = announce.listen_addr else {
            return;
        };

        let mut introductions: Vec<(Arc<dyn CandidateSink>, SocketAddr)> = Vec::new();
        {
            let mut torrents = self.torrents.lock();
            if announce.event == AnnounceEvent::Stopped {
                if let Some(members) = torrents.get_mut(&announce.info_hash) {
                    members.remove(&addr);
                    if members.is_empty() {
                        torrents.remove(&announce.info_hash);
                    }
                }
                return;
            }

            let members = torrents.entry(announce.info_hash).or_default();
            members.retain(|_, member| member.sink.strong_count() > 0);

            for (&other, member) in members.iter() {
                if other == addr
                    || (announce.role == Role::Seeding && member.role == Role::Seeding)
                {
                    continue;
                }
                if let Some(own) = sink.upgrade() {
                    introductions.push((own, other));
                }
                if let Some(theirs) = member.sink.upgrade() {
                    introductions.push((theirs, addr));
                }
            }

            members.insert(
                addr,
                Member {
                    role: announce.role,
                    sink: sink.clone(),
                },
            );
        }

        // Sinks may call back into the directory; deliver without the lock.
        for (target, candidate) in introductions {
            target.candidate_peer(announce.info_hash, candidate);
        }
    }
}

/// One announcer's handle on a [`LocalDirectory`].
pub struct LocalDirectoryClient {
    directory: LocalDirectory,
    sink: Weak<dyn CandidateSink>,
}

#[async_trait]
impl Discovery for LocalDirectoryClient {
    async fn announce(&self, announce: &Announce) {
        tracing::debug!(
            info_hash = %announce.info_hash,
            event = announce.event.as_str(),
            listen_addr = ?announce.listen_addr,
            "local directory announce"
        );
        self.directory.register(announce, &self.sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(InfoHash, SocketAddr)>>,
    }

    impl CandidateSink for Recorder {
        fn candidate_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
            self.seen.lock().push((info_hash, addr));
        }
    }

    fn announce(info_hash: InfoHash, role: Role, event: AnnounceEvent, port: u16) -> Announce {
        Announce {
            info_hash,
            role,
            event,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            listen_addr: Some(SocketAddr::from(([127, 0, 0, 1], port))),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_announcers_learn_about_each_other() {
        let directory = LocalDirectory::new();
        let hash = InfoHash::from([1u8; 20]);
        let seeder = Arc::new(Recorder::default());
        let leecher = Arc::new(Recorder::default());

        let seeder_client = directory.client(seeder.clone());
        let leecher_client = directory.client(leecher.clone());

        seeder_client
            .announce(&announce(hash, Role::Seeding, AnnounceEvent::Started, 7000))
            .await;
        assert!(seeder.seen.lock().is_empty());

        leecher_client
            .announce(&announce(hash, Role::Leeching, AnnounceEvent::Started, 7001))
            .await;
        assert_eq!(*leecher.seen.lock(), vec![(hash, addr(7000))]);
        assert_eq!(*seeder.seen.lock(), vec![(hash, addr(7001))]);
        assert_eq!(directory.peers(&hash), vec![addr(7000), addr(7001)]);
    }

    #[tokio::test]
    async fn test_seeders_are_not_introduced() {
        let directory = LocalDirectory::new();
        let hash = InfoHash::from([2u8; 20]);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        directory
            .client(first.clone())
            .announce(&announce(hash, Role::Seeding, AnnounceEvent::Started, 7000))
            .await;
        directory
            .client(second.clone())
            .announce(&announce(hash, Role::Seeding, AnnounceEvent::Started, 7001))
            .await;

        assert!(first.seen.lock().is_empty());
        assert!(second.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_torrents_are_separate_and_stop_removes() {
        let directory = LocalDirectory::new();
        let a = InfoHash::from([3u8; 20]);
        let b = InfoHash::from([4u8; 20]);
        let sink = Arc::new(Recorder::default());
        let client = directory.client(sink.clone());

        client
            .announce(&announce(a, Role::Leeching, AnnounceEvent::Started, 7000))
            .await;
        client
            .announce(&announce(b, Role::Leeching, AnnounceEvent::Started, 7000))
            .await;
        assert!(sink.seen.lock().is_empty());
        assert_eq!(directory.peers(&a), vec![addr(7000)]);

        client
            .announce(&announce(a, Role::Leeching, AnnounceEvent::Stopped, 7000))
            .await;
        assert!(directory.peers(&a).is_empty());
        assert_eq!(directory.peers(&b), vec![addr(7000)]);
    }

    #[tokio::test]
    async fn test_dropped_sinks_are_forgotten() {
        let directory = LocalDirectory::new();
        let hash = InfoHash::from([5u8; 20]);
        let gone = Arc::new(Recorder::default());
        directory
            .client(gone.clone())
            .announce(&announce(hash, Role::Leeching, AnnounceEvent::Started, 7000))
            .await;
        drop(gone);

        let sink = Arc::new(Recorder::default());
        directory
            .client(sink.clone())
            .announce(&announce(hash, Role::Leeching, AnnounceEvent::Started, 7001))
            .await;

        assert!(sink.seen.lock().is_empty());
        assert_eq!(directory.peers(&hash), vec![addr(7001)]);
    }
}
