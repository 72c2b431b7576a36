//! Camera rig for the local avatar.
//!
//! Four modes: first-person (eye at head, avatar mesh hidden),
//! third-person orbit, free, and cinematic. Mouse deltas map to
//! yaw/pitch with configurable sensitivity.

use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMode {
    FirstPerson,
    ThirdPerson,
    Free,
    Cinematic,
}

/// Camera frame handed to agent updates and the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub center: Vec3,
    pub at_axis: Vec3,
    pub left_axis: Vec3,
    pub up_axis: Vec3,
}

#[derive(Debug, Clone)]
pub struct CameraRig {
    mode: CameraMode,
    yaw: f32,
    pitch: f32,
    distance: f32,
    sensitivity: f32,
    /// Free/cinematic position, detached from the avatar.
    free_position: Vec3,
}

impl Default for CameraRig {
    fn default() -> Self {
        Self {
            mode: CameraMode::ThirdPerson,
            yaw: 0.0,
            pitch: 0.0,
            distance: 4.0,
            sensitivity: 0.005,
            free_position: Vec3::ZERO,
        }
    }
}

impl CameraRig {
    pub fn mode(&self) -> CameraMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CameraMode) {
        self.mode = mode;
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn set_yaw(&mut self, yaw: f32) {
        self.yaw = yaw;
    }

    pub fn set_distance(&mut self, distance: f32) {
        self.distance = distance.clamp(1.0, 32.0);
    }

    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        self.sensitivity = sensitivity;
    }

    /// The avatar mesh is hidden only in first person.
    pub fn avatar_visible(&self) -> bool {
        self.mode != CameraMode::FirstPerson
    }

    pub fn apply_mouse(&mut self, dx: f32, dy: f32) {
        self.yaw += dx * self.sensitivity;
        self.pitch = (self.pitch - dy * self.sensitivity)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }

    pub fn move_free(&mut self, delta: Vec3) {
        self.free_position += delta;
    }

    fn facing(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
    }

    /// Compute the camera frame for the current mode.
    pub fn view(&self, avatar_position: Vec3, avatar_height: f32) -> CameraView {
        let at_axis = self.facing();
        let left_axis = Vec3::new(-at_axis.z, 0.0, at_axis.x).normalize_or_zero();
        let up_axis = at_axis.cross(left_axis).normalize_or_zero();
        let eye_height = avatar_height * 0.9;

        let center = match self.mode {
            CameraMode::FirstPerson => avatar_position + Vec3::Y * eye_height,
            CameraMode::ThirdPerson => {
                avatar_position + Vec3::Y * eye_height - at_axis * self.distance
            }
            CameraMode::Free | CameraMode::Cinematic => self.free_position,
        };

        CameraView {
            center,
            at_axis,
            left_axis,
            up_axis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_person_at_eye_height() {
        let mut rig = CameraRig::default();
        rig.set_mode(CameraMode::FirstPerson);
        let view = rig.view(Vec3::new(10.0, 0.0, 10.0), 1.8);
        assert!((view.center.y - 1.62).abs() < 1e-4);
        assert!(!rig.avatar_visible());
    }

    #[test]
    fn test_third_person_orbits_behind() {
        let rig = CameraRig::default();
        let view = rig.view(Vec3::ZERO, 1.8);
        // Yaw 0 faces +X; the camera sits behind on -X.
        assert!(view.center.x < 0.0);
        assert!(rig.avatar_visible());
    }

    #[test]
    fn test_mouse_changes_yaw_and_clamps_pitch() {
        let mut rig = CameraRig::default();
        rig.apply_mouse(100.0, 0.0);
        assert!(rig.yaw() > 0.0);

        for _ in 0..1000 {
            rig.apply_mouse(0.0, -100.0);
        }
        let view = rig.view(Vec3::ZERO, 1.8);
        // Pitch clamped short of straight up.
        assert!(view.at_axis.y < 1.0);
    }

    #[test]
    fn test_free_mode_detached() {
        let mut rig = CameraRig::default();
        rig.set_mode(CameraMode::Free);
        rig.move_free(Vec3::new(5.0, 5.0, 5.0));
        let view = rig.view(Vec3::new(100.0, 0.0, 100.0), 1.8);
        assert_eq!(view.center, Vec3::new(5.0, 5.0, 5.0));
    }
}
