/*!
 * Transfer engine building blocks
 *
 * Stages are bounded channels connected by processors; generators start a
 * pipeline and consumers drain it. Everything observes one [`cancel::CancelToken`]
 * so a failure anywhere stops the whole transfer.
 */

pub mod cancel;
pub mod chunk;
pub mod filter;
pub mod generator;
pub mod pipeline;
pub mod progress;
