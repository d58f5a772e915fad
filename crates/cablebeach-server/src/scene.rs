use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cablebeach_config::Scene;
use cablebeach_contracts::{ChatDelivery, RegionLocation, Vector3};
use cablebeach_kernel::{ChatListener, ChatRegion};
use serde::Deserialize;
use uuid::Uuid;

/// An avatar present in a region. Chat addressed to it queues up in its inbox.
pub struct Presence {
    agent_id: Uuid,
    name: String,
    position: Vector3,
    child_agent: bool,
    inbox: Mutex<Vec<ChatDelivery>>,
}

impl Presence {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn drain(&self) -> Vec<ChatDelivery> {
        std::mem::take(&mut *self.inbox.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ChatListener for Presence {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn position(&self) -> Vector3 {
        self.position
    }

    fn is_child_agent(&self) -> bool {
        self.child_agent
    }

    fn deliver(&self, delivery: ChatDelivery) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub agent_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub position: Vector3,
    #[serde(default)]
    pub child_agent: bool,
}

pub struct Region {
    name: String,
    location: RegionLocation,
    presences: RwLock<HashMap<Uuid, Arc<Presence>>>,
}

impl Region {
    pub fn new(name: impl Into<String>, location: RegionLocation) -> Self {
        Self {
            name: name.into(),
            location,
            presences: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds or replaces the presence for `req.agent_id`.
    pub fn join(&self, req: JoinRequest) {
        let presence = Arc::new(Presence {
            agent_id: req.agent_id,
            name: format!("{} {}", req.first_name, req.last_name),
            position: req.position,
            child_agent: req.child_agent,
            inbox: Mutex::new(Vec::new()),
        });
        self.presences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(req.agent_id, presence);
    }

    pub fn leave(&self, agent_id: Uuid) -> bool {
        self.presences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&agent_id)
            .is_some()
    }

    pub fn presence(&self, agent_id: Uuid) -> Option<Arc<Presence>> {
        self.presences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .cloned()
    }
}

impl ChatRegion for Region {
    fn location(&self) -> RegionLocation {
        self.location
    }

    fn listeners(&self) -> Vec<Arc<dyn ChatListener>> {
        self.presences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| Arc::clone(p) as Arc<dyn ChatListener>)
            .collect()
    }
}

/// Regions hosted by this process, fixed at startup.
pub struct SceneRegistry {
    regions: Vec<Region>,
}

impl SceneRegistry {
    pub fn from_config(scene: &Scene) -> Self {
        Self {
            regions: scene
                .regions
                .iter()
                .map(|r| {
                    Region::new(
                        r.name.clone(),
                        RegionLocation {
                            grid_x: r.grid_x,
                            grid_y: r.grid_y,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Drains everything queued for `agent_id` across all regions.
    pub fn drain_messages(&self, agent_id: Uuid) -> Option<Vec<ChatDelivery>> {
        let mut found = false;
        let mut out = Vec::new();
        for region in &self.regions {
            if let Some(presence) = region.presence(agent_id) {
                found = true;
                out.extend(presence.drain());
            }
        }
        found.then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cablebeach_config::Region as RegionConfig;
    use cablebeach_contracts::{ChatEvent, ChatSource, ChatType};
    use cablebeach_kernel::{ChatConfig, ChatEngine};

    fn registry() -> SceneRegistry {
        SceneRegistry::from_config(&Scene {
            regions: vec![
                RegionConfig {
                    name: "west".to_string(),
                    grid_x: 1000,
                    grid_y: 1000,
                },
                RegionConfig {
                    name: "east".to_string(),
                    grid_x: 1001,
                    grid_y: 1000,
                },
            ],
        })
    }

    fn join(region: &Region, agent_id: Uuid, x: f32) {
        region.join(JoinRequest {
            agent_id,
            first_name: "Test".to_string(),
            last_name: "Agent".to_string(),
            position: Vector3::new(x, 128.0, 25.0),
            child_agent: false,
        });
    }

    #[test]
    fn shout_crosses_region_border() {
        let scene = registry();
        let speaker = Uuid::new_v4();
        let listener = Uuid::new_v4();
        join(scene.region("west").unwrap(), speaker, 250.0);
        join(scene.region("east").unwrap(), listener, 20.0);

        let event = ChatEvent {
            channel: 0,
            message: "over here".to_string(),
            chat_type: ChatType::Shout,
            source: ChatSource::Agent,
            sender_id: Some(speaker),
            sender_name: "Test Agent".to_string(),
            position: Vector3::new(250.0, 128.0, 25.0),
            origin: RegionLocation {
                grid_x: 1000,
                grid_y: 1000,
            },
            owner_id: None,
        };
        let engine = ChatEngine::new(ChatConfig::default());
        assert_eq!(engine.deliver(&event, scene.regions()), 2);

        let heard = scene.drain_messages(listener).unwrap();
        assert_eq!(heard.len(), 1);
        assert_eq!(heard[0].from_id, speaker);
        assert!(scene.drain_messages(listener).unwrap().is_empty());
    }

    #[test]
    fn leave_removes_presence() {
        let scene = registry();
        let agent = Uuid::new_v4();
        let west = scene.region("west").unwrap();
        join(west, agent, 10.0);
        assert!(west.leave(agent));
        assert!(!west.leave(agent));
        assert!(scene.drain_messages(agent).is_none());
    }
}
