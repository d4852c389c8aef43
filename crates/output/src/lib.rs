// Copyright 2025-2026 CEMAXECUTER LLC

pub mod file;
