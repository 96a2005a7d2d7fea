//! CausalBert model components on the Candle framework.
//!
//! A pretrained masked-language-model encoder is adapted into a multi-head
//! predictor that jointly reconstructs masked tokens, predicts the
//! propensity of treatment, and predicts the outcome under each treatment
//! arm. See [`CausalBert`] for the joint forward pass.

pub mod confounder;
pub mod device;
pub mod encoder;
pub mod heads;
pub mod losses;
pub mod mlm;
pub mod model;
pub mod pretrained;
pub mod store;
pub mod tokenizer;

pub use confounder::{confounder_tensor, encode_confounders};
pub use device::{device_name, select_device};
pub use encoder::{BagOfEmbeddingsEncoder, BertEncoder, EncoderOutput, TextEncoder};
pub use heads::{OutcomeHead, OutcomeHeads, PropensityHead};
pub use losses::{partition_by_arm, ArmPartition};
pub use mlm::{mask_tokens, MaskedTokens, MlmHead};
pub use model::{Batch, CausalBert, ForwardOutput, PretrainOutput};
pub use pretrained::{
    check_mask_token, fetch_pretrained, from_pretrained, load_pretrained, PretrainedFiles,
};
pub use store::{ParameterStore, SeedReport};
pub use tokenizer::{word_level_tokenizer_json, HfTokenizer, TextTokenizer, TokenizedText};
