use crate::runner::{Rescorer, RetentionRunner};
use percolate_core::engine::Report;
use percolate_core::fdr::ScoredPsm;

/// Percolator-style weight row: space separated, bias last
fn weight_row(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| ryu::Buffer::new().format(*v).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Rescorer {
    pub fn serialize_psm(&self, psm: &ScoredPsm) -> csv::ByteRecord {
        let record = &self.matrix.records()[psm.index];
        let mut row = csv::ByteRecord::new();
        row.push_field(record.id.as_bytes());
        row.push_field(ryu::Buffer::new().format(psm.score).as_bytes());
        row.push_field(ryu::Buffer::new().format(psm.q_value).as_bytes());
        row.push_field(ryu::Buffer::new().format(psm.posterior_error).as_bytes());
        row.push_field(record.peptide.as_deref().unwrap_or_default().as_bytes());
        row.push_field(record.proteins.join(";").as_bytes());
        row
    }

    /// Ranked PSMs with the given label, tab-delimited
    pub fn format_psms(&self, report: &Report, decoys: bool) -> anyhow::Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let headers = csv::ByteRecord::from(vec![
            "PSMId",
            "score",
            "q-value",
            "posterior_error_prob",
            "peptide",
            "proteinIds",
        ]);

        wtr.write_byte_record(&headers)?;
        for psm in report.table.rows().iter().filter(|psm| psm.decoy == decoys) {
            wtr.write_byte_record(&self.serialize_psm(psm))?;
        }

        wtr.flush()?;
        Ok(wtr.into_inner()?)
    }

    /// One row per weight vector, in training order, with feature names in a
    /// comment header. Rows are averaged over the cross-validation folds.
    pub fn format_weights(&self, report: &Report) -> String {
        let mut out = String::from("#");
        for name in self.matrix.names() {
            out.push(' ');
            out.push_str(name);
        }
        out.push_str(" m0\n");
        for weights in &report.weights {
            out.push_str(&weight_row(weights.as_slice()));
            out.push('\n');
        }
        out
    }
}

impl RetentionRunner {
    /// Predicted (and observed, if known) retention time per test peptide
    pub fn format_predictions(
        &self,
        peptides: &[String],
        predicted: &[f64],
        observed: Option<&[f64]>,
    ) -> anyhow::Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let mut headers = csv::ByteRecord::from(vec!["peptide", "predicted_rt"]);
        if observed.is_some() {
            headers.push_field(b"observed_rt");
        }
        wtr.write_byte_record(&headers)?;

        for (i, (peptide, predicted)) in peptides.iter().zip(predicted).enumerate() {
            let mut row = csv::ByteRecord::new();
            row.push_field(peptide.as_bytes());
            row.push_field(ryu::Buffer::new().format(*predicted).as_bytes());
            if let Some(observed) = observed {
                row.push_field(ryu::Buffer::new().format(observed[i]).as_bytes());
            }
            wtr.write_byte_record(&row)?;
        }

        wtr.flush()?;
        Ok(wtr.into_inner()?)
    }
}
