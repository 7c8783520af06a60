// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_camera;
pub mod acquisition;
pub mod camera_sdk;
pub mod control;
pub mod error;
pub mod image_sdk;
pub mod image_sink;
pub mod pointgrey_camera;
pub mod select_camera;
