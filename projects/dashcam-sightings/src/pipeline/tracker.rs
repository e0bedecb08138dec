// Track association: turns per-frame observations of one video into
// finalized vehicle sightings.
//
// Association is greedy and single pass. A detection carrying a plate joins the
// first open track holding the same plate; a plateless detection joins the first
// open track (creation order) whose box overlaps it by more than the IoU
// threshold. Tracks close after an inactivity window or at end of stream.

use crate::pipeline::types::{
    BBox, Observation, PipelineConfig, Sighting, SightingOrigin, TrackedPlate, VehicleIdentity,
};

/// Local identifier of a track inside one video's arena
pub type TrackId = usize;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub inactivity_window: f64,
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            inactivity_window: 2.0,
            iou_threshold: 0.5,
        }
    }
}

impl From<&PipelineConfig> for TrackerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            inactivity_window: config.inactivity_window,
            iou_threshold: config.iou_threshold,
        }
    }
}

/// In-progress vehicle hypothesis
#[derive(Debug, Clone)]
struct Track {
    time_start: f64,
    time_end: f64,
    bbox: BBox,
    confidence: f32,
    plate: Option<TrackedPlate>,
    identity: Option<VehicleIdentity>,
}

impl Track {
    fn open(timestamp: f64, observation: Observation) -> Self {
        let plate = observation.plate.map(|p| TrackedPlate {
            number: p.number,
            confidence: p.confidence,
            bbox: p.bbox,
            first_appearance: timestamp,
            last_appearance: timestamp,
        });
        Self {
            time_start: timestamp,
            time_end: timestamp,
            bbox: observation.detection.bbox,
            confidence: observation.detection.confidence,
            plate,
            identity: observation.identity,
        }
    }

    /// Fold a matched observation into the track.
    fn absorb(&mut self, timestamp: f64, observation: Observation) {
        self.time_end = self.time_end.max(timestamp);
        self.bbox = observation.detection.bbox;
        self.confidence = self.confidence.max(observation.detection.confidence);

        if let Some(reading) = observation.plate {
            match self.plate.as_mut() {
                Some(plate) => {
                    plate.confidence = plate.confidence.max(reading.confidence);
                    plate.bbox = reading.bbox;
                    plate.last_appearance = plate.last_appearance.max(timestamp);
                }
                None => {
                    self.plate = Some(TrackedPlate {
                        number: reading.number,
                        confidence: reading.confidence,
                        bbox: reading.bbox,
                        first_appearance: timestamp,
                        last_appearance: timestamp,
                    });
                }
            }
        }

        if observation.identity.is_some() {
            self.identity = observation.identity;
        }
    }

    fn into_sighting(self, origin: &SightingOrigin) -> Sighting {
        Sighting {
            time_start: self.time_start,
            time_end: self.time_end,
            bbox: self.bbox,
            confidence: self.confidence,
            plate: self.plate,
            identity: self.identity,
            origin: origin.clone(),
        }
    }
}

/// Arena of tracks for one video. Slots are never reused, so a `TrackId` stays
/// valid (or empty) for the lifetime of the table; `open` keeps creation order.
#[derive(Debug, Default)]
struct TrackTable {
    slots: Vec<Option<Track>>,
    open: Vec<TrackId>,
}

impl TrackTable {
    fn insert(&mut self, track: Track) -> TrackId {
        let id = self.slots.len();
        self.slots.push(Some(track));
        self.open.push(id);
        id
    }

    fn get(&self, id: TrackId) -> Option<&Track> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Open tracks in creation order
    fn iter_open(&self) -> impl Iterator<Item = (TrackId, &Track)> + '_ {
        self.open
            .iter()
            .filter_map(move |&id| self.get(id).map(|t| (id, t)))
    }

    fn close(&mut self, id: TrackId) -> Option<Track> {
        self.open.retain(|&open_id| open_id != id);
        self.slots.get_mut(id).and_then(|s| s.take())
    }

    fn len_open(&self) -> usize {
        self.open.len()
    }
}

/// Track association engine for a single video
pub struct TrackAssociator {
    config: TrackerConfig,
    origin: SightingOrigin,
    table: TrackTable,
}

impl TrackAssociator {
    pub fn new(config: TrackerConfig, origin: SightingOrigin) -> Self {
        Self {
            config,
            origin,
            table: TrackTable::default(),
        }
    }

    pub fn open_tracks(&self) -> usize {
        self.table.len_open()
    }

    /// Process every observation of one sampled frame and return the sightings
    /// that closed at this timestamp, in closure order.
    ///
    /// Tracks already stale at `timestamp` are closed before association so a
    /// returning vehicle after the inactivity window always opens a new track.
    pub fn observe_frame(&mut self, timestamp: f64, observations: Vec<Observation>) -> Vec<Sighting> {
        let mut closed = self.sweep(timestamp);

        for observation in observations {
            self.associate(timestamp, observation);
        }

        closed.extend(self.sweep(timestamp));
        closed
    }

    /// Close every remaining track regardless of staleness.
    pub fn finish(mut self) -> Vec<Sighting> {
        let ids: Vec<TrackId> = self.table.open.clone();
        ids.into_iter()
            .filter_map(|id| self.table.close(id))
            .map(|track| track.into_sighting(&self.origin))
            .collect()
    }

    fn associate(&mut self, timestamp: f64, observation: Observation) -> TrackId {
        let matched = match observation.plate.as_ref() {
            Some(reading) => self.find_by_plate(&reading.number),
            None => self.find_by_overlap(&observation.detection.bbox),
        };

        match matched {
            Some(id) => {
                if let Some(track) = self.table.get_mut(id) {
                    track.absorb(timestamp, observation);
                }
                id
            }
            None => {
                let id = self.table.insert(Track::open(timestamp, observation));
                tracing::debug!("Opened track {} at {:.3}s", id, timestamp);
                id
            }
        }
    }

    fn find_by_plate(&self, number: &str) -> Option<TrackId> {
        self.table
            .iter_open()
            .find(|(_, track)| track.plate.as_ref().map(|p| p.number.as_str()) == Some(number))
            .map(|(id, _)| id)
    }

    fn find_by_overlap(&self, bbox: &BBox) -> Option<TrackId> {
        self.table
            .iter_open()
            .find(|(_, track)| track.bbox.iou(bbox) > self.config.iou_threshold)
            .map(|(id, _)| id)
    }

    fn sweep(&mut self, timestamp: f64) -> Vec<Sighting> {
        let stale: Vec<TrackId> = self
            .table
            .iter_open()
            .filter(|(_, track)| timestamp - track.time_end > self.config.inactivity_window)
            .map(|(id, _)| id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.table.close(id))
            .map(|track| track.into_sighting(&self.origin))
            .collect()
    }
}
