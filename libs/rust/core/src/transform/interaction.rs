//! Stateless pairwise product column.

use async_trait::async_trait;
use crate::error::{CvError, Result};
use crate::frame::Frame;
use super::{DataTransformStage, DataTransformer, TransformContext};

pub struct Interaction {
    name: String,
    left: String,
    right: String,
}

impl Interaction {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        let (left, right) = (left.into(), right.into());
        Self { name: format!("{left}_x_{right}"), left, right }
    }

    pub fn output_column(&self) -> &str { &self.name }
}

#[async_trait]
impl DataTransformer for Interaction {
    fn name(&self) -> &str { &self.name }

    async fn transform(&self, mut frame: Frame, _stage: DataTransformStage, _ctx: Option<&TransformContext>) -> Result<Frame> {
        let missing = |c: &str| CvError::Configuration(format!("{}: column `{c}` not in frame", self.name));
        let l = frame.column(&self.left).ok_or_else(|| missing(&self.left))?;
        let r = frame.column(&self.right).ok_or_else(|| missing(&self.right))?;
        let product: Vec<f64> = l.iter().zip(r).map(|(a, b)| a * b).collect();
        frame.add_column(self.name.clone(), product)?;
        Ok(frame)
    }
}
