// Copyright © 2023 David Caldwell <david@porkrind.org>

pub mod block;
pub mod error;
pub mod fdc;
pub mod fs;
pub mod ops;
