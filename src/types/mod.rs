/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple sub-protocols of the replication engine.

pub mod crypto_primitives;

pub mod data_types;

pub mod signed_messages;
