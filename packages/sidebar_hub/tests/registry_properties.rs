use std::collections::BTreeSet;

use proptest::prelude::*;

use page_channel::memory::{self, MemoryPort};
use page_channel::{ChannelOptions, MessageChannel, once};
use sidebar_hub::PeerSource;
use sidebar_hub::session::{Exclusion, PeerChannel, SessionRegistry, TabDescriptor};

/// One generated tab: active when it connected, made active later through
/// the active-tab snapshot, and which peers it has.
#[derive(Debug, Clone, Copy)]
struct TabSetup {
    active: bool,
    activated_later: bool,
    has_sidebar: bool,
    has_content_script: bool,
}

fn arb_tab() -> impl Strategy<Value = TabSetup> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(active, activated_later, has_sidebar, content_script)| TabSetup {
            active,
            activated_later,
            has_sidebar,
            // Every session holds at least one peer
            has_content_script: content_script || !has_sidebar,
        },
    )
}

fn arb_tabs() -> impl Strategy<Value = (Vec<TabSetup>, u64)> {
    prop::collection::vec(arb_tab(), 0..8).prop_flat_map(|tabs| {
        // Origin may also be a tab the registry does not know
        let origin = 1..=(tabs.len() as u64 + 1);
        (Just(tabs), origin)
    })
}

fn peer(id: u64) -> (PeerChannel, MemoryPort) {
    let (local, remote) = memory::pair();
    let channel = MessageChannel::connect(
        format!("peer-{id}"),
        once(local.into_direct()),
        ChannelOptions::default(),
    );
    (PeerChannel { id, channel }, remote)
}

/// Whether `remote` got anything before a marker sent after the fan-out.
async fn reached(channel: &MessageChannel, remote: &mut MemoryPort) -> bool {
    channel.notify("marker", None);
    let first = remote.recv_message().await.expect("peer channel went away");
    first.method() != Some("marker")
}

struct ConnectedPeer {
    tab_id: u64,
    source: PeerSource,
    channel: MessageChannel,
    remote: MemoryPort,
}

fn run(tabs: Vec<TabSetup>, origin: u64) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let mut registry = SessionRegistry::new();
        let mut peers = Vec::new();
        let mut next_peer = 1;

        for (index, setup) in tabs.iter().enumerate() {
            let tab_id = index as u64 + 1;
            let tab = TabDescriptor {
                id: tab_id,
                window_id: 1,
                url: format!("https://site{}.example/", tab_id % 3),
                title: String::new(),
                active: setup.active,
                zoom_factor: None,
            };
            let sources = [
                (setup.has_content_script, PeerSource::ContentScript),
                (setup.has_sidebar, PeerSource::Sidebar),
            ];
            for (present, source) in sources {
                if !present {
                    continue;
                }
                let (peer, remote) = peer(next_peer);
                next_peer += 1;
                let channel = peer.channel.clone();
                registry.attach(source, &tab, &format!("p{tab_id}"), peer);
                peers.push(ConnectedPeer {
                    tab_id,
                    source,
                    channel,
                    remote,
                });
            }
        }
        registry.set_active_tabs(
            tabs.iter()
                .enumerate()
                .filter(|(_, setup)| setup.activated_later)
                .map(|(index, _)| index as u64 + 1),
        );

        let expected: BTreeSet<u64> = tabs
            .iter()
            .enumerate()
            .map(|(index, setup)| (index as u64 + 1, setup))
            .filter(|(tab_id, setup)| {
                *tab_id != origin && !(setup.active || setup.activated_later)
            })
            .map(|(tab_id, _)| tab_id)
            .collect();

        let sent = registry.notify_all(
            "set-view",
            Some(serde_json::json!({"view": "hidden"})),
            Exclusion {
                tab: Some(origin),
                seen: true,
            },
        );
        prop_assert_eq!(sent, expected.len());

        let mut got = BTreeSet::new();
        for attached in &mut peers {
            if !reached(&attached.channel, &mut attached.remote).await {
                continue;
            }
            let setup = tabs[(attached.tab_id - 1) as usize];
            // Only one peer per session receives the broadcast, the sidebar
            // when there is one
            let broadcast = if setup.has_sidebar {
                PeerSource::Sidebar
            } else {
                PeerSource::ContentScript
            };
            prop_assert_eq!(attached.source, broadcast, "tab {}", attached.tab_id);
            prop_assert!(got.insert(attached.tab_id), "tab {} reached twice", attached.tab_id);
        }
        prop_assert_eq!(got, expected);
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn default_view_fanout_skips_origin_and_seen_tabs((tabs, origin) in arb_tabs()) {
        run(tabs, origin)?;
    }
}
